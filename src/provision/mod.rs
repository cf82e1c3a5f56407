//! Runtime provisioning: fetch, unpack, locate and verify an interpreter.
//!
//! This module provides:
//! - Mirror-aware downloads with redirect walking and a size gate
//! - Zip extraction with overwrite semantics
//! - Executable lookup in release archives of varying layout
//! - PHP release catalog, verification and `php.ini` rendering
//! - Staging a verified interpreter into a project tree

pub mod downloader;
pub mod extract;
pub mod locate;
pub mod php;

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::DownloadConfig;
use crate::events::EventSink;
use crate::fsops::{FsError, FsMutator};
use crate::runtime::{sync_tree, SyncError, SyncReport};

pub use downloader::{DownloadError, DownloadReport, DownloadTask, Downloader};
pub use extract::{extract_archive, ExtractError, ExtractSummary};
pub use locate::{locate_executable, platform_executable};
pub use php::{PhpIni, Verification};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("unknown runtime version {version} (known: {known})")]
    UnknownVersion { version: String, known: String },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("corrupt archive {archive} detected and deleted, please try again: {source}")]
    CorruptArchive {
        archive: PathBuf,
        #[source]
        source: ExtractError,
    },

    #[error("verification failed: {executable} not found under {root}")]
    ExecutableNotFound { executable: String, root: PathBuf },

    #[error("verification failed: {executable} is corrupt or incompatible ({reason})")]
    VerificationFailed { executable: PathBuf, reason: String },

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ProvisionError + '_ {
    move |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A verified interpreter ready to be staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedRuntime {
    pub version: String,
    /// Directory that directly contains the executable
    pub binary_dir: PathBuf,
    pub executable: PathBuf,
    /// First line of `-v` output
    pub banner: String,
}

/// Fetches and caches interpreter releases under a cache directory
pub struct RuntimeProvisioner {
    cache_dir: PathBuf,
    config: DownloadConfig,
    downloader: Downloader,
    mutator: FsMutator,
    executable_stem: String,
}

impl RuntimeProvisioner {
    pub fn new(
        cache_dir: PathBuf,
        config: DownloadConfig,
        mutator: FsMutator,
    ) -> Result<Self, ProvisionError> {
        let downloader = Downloader::new(&config)?;
        Ok(Self {
            cache_dir,
            config,
            downloader,
            mutator,
            executable_stem: "php".to_string(),
        })
    }

    /// Archive path for a catalog file name
    pub fn archive_path(&self, file: &str) -> PathBuf {
        self.cache_dir.join(file)
    }

    /// Extraction directory for a short version
    pub fn extract_dir(&self, version: &str) -> PathBuf {
        self.cache_dir.join(format!("php-{}", version))
    }

    /// Make `version` available locally and return the verified executable.
    #[instrument(skip(self, events))]
    pub async fn provision(
        &self,
        version: &str,
        events: &EventSink,
    ) -> Result<ProvisionedRuntime, ProvisionError> {
        let file = php::archive_name(&self.config.releases, version).ok_or_else(|| {
            ProvisionError::UnknownVersion {
                version: version.to_string(),
                known: self
                    .config
                    .releases
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })?;

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(io_error(&self.cache_dir))?;

        let archive = self.archive_path(file);
        self.ensure_archive(&archive, file, events).await?;

        events.status(Some(100.0), "Extracting files...");
        let extract_dir = self.extract_dir(version);
        self.unpack(&archive, &extract_dir).await?;

        events.status(Some(100.0), "Verifying binary...");
        let executable_name = platform_executable(&self.executable_stem);
        let binary_dir = locate_executable(&extract_dir, &executable_name).ok_or_else(|| {
            ProvisionError::ExecutableNotFound {
                executable: executable_name.clone(),
                root: extract_dir.clone(),
            }
        })?;
        let executable = binary_dir.join(&executable_name);

        let banner = match php::verify_interpreter(&executable).await {
            Ok(Verification::Valid(banner)) => banner,
            Ok(Verification::Unexpected(reason)) => {
                return Err(ProvisionError::VerificationFailed { executable, reason })
            }
            Err(e) => {
                return Err(ProvisionError::VerificationFailed {
                    executable,
                    reason: e.to_string(),
                })
            }
        };

        info!(
            version,
            executable = %executable.display(),
            banner = %banner,
            "Runtime provisioned"
        );

        Ok(ProvisionedRuntime {
            version: version.to_string(),
            binary_dir,
            executable,
            banner,
        })
    }

    /// Reuse a cached archive when it passes the size gate, otherwise download it
    async fn ensure_archive(
        &self,
        archive: &Path,
        file: &str,
        events: &EventSink,
    ) -> Result<(), ProvisionError> {
        if let Ok(meta) = tokio::fs::metadata(archive).await {
            if meta.len() >= self.config.min_size_bytes {
                info!(archive = %archive.display(), "Reusing cached archive");
                return Ok(());
            }
            warn!(
                archive = %archive.display(),
                size = meta.len(),
                "Cached archive is undersized, downloading again"
            );
            tokio::fs::remove_file(archive)
                .await
                .map_err(io_error(archive))?;
        }

        let task = DownloadTask {
            candidates: php::mirror_urls(&self.config.mirrors, file),
            destination: archive.to_path_buf(),
            min_size_bytes: self.config.min_size_bytes,
        };
        self.downloader.fetch(&task, events).await?;
        Ok(())
    }

    /// Extract into a fresh directory; an extraction failure condemns the archive
    async fn unpack(&self, archive: &Path, extract_dir: &Path) -> Result<(), ProvisionError> {
        self.mutator.clear(extract_dir).await?;
        tokio::fs::create_dir_all(extract_dir)
            .await
            .map_err(io_error(extract_dir))?;

        let source = archive.to_path_buf();
        let dest = extract_dir.to_path_buf();
        let result = tokio::task::spawn_blocking(move || extract_archive(&source, &dest))
            .await
            .map_err(|join| ProvisionError::Io {
                path: archive.to_path_buf(),
                source: io::Error::other(join),
            })?;

        if let Err(source) = result {
            warn!(archive = %archive.display(), error = %source, "Extraction failed, discarding archive");
            if let Err(e) = tokio::fs::remove_file(archive).await {
                warn!(archive = %archive.display(), error = %e, "Could not delete corrupt archive");
            }
            if let Err(e) = self.mutator.clear(extract_dir).await {
                warn!(dir = %extract_dir.display(), error = %e, "Could not remove partial extraction");
            }
            return Err(ProvisionError::CorruptArchive {
                archive: archive.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

/// Result of copying an interpreter into a project
#[derive(Debug)]
pub struct StagedInterpreter {
    pub dir: PathBuf,
    pub ini_path: PathBuf,
    pub report: SyncReport,
}

/// Replace `<project>/bin/php` with a copy of `interpreter_dir` and write its `php.ini`.
#[instrument(skip(ini, mutator), fields(project = %project_root.display()))]
pub async fn stage_interpreter(
    project_root: &Path,
    interpreter_dir: &Path,
    ini: &PhpIni,
    mutator: &FsMutator,
) -> Result<StagedInterpreter, ProvisionError> {
    let dest = project_root.join("bin").join("php");
    mutator.clear(&dest).await?;

    let source = interpreter_dir.to_path_buf();
    let target = dest.clone();
    let report = tokio::task::spawn_blocking(move || sync_tree(&source, &target))
        .await
        .map_err(|join| ProvisionError::Io {
            path: dest.clone(),
            source: io::Error::other(join),
        })??;

    let ini_path = ini.write_to(&dest).map_err(io_error(&dest))?;
    info!(
        dest = %dest.display(),
        files = report.copied,
        "Interpreter staged"
    );

    Ok(StagedInterpreter {
        dir: dest,
        ini_path,
        report,
    })
}
