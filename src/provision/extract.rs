//! Zip extraction with overwrite semantics.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("cannot open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not a readable zip archive: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ZipError,
    },

    #[error("archive entry #{index} is unreadable: {source}")]
    Entry {
        index: usize,
        #[source]
        source: ZipError,
    },

    #[error("archive entry {name:?} escapes the destination directory")]
    UnsafePath { name: String },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
}

/// Unpack `archive_path` into `dest`, replacing files that already exist.
///
/// Blocking; run it on a blocking thread from async code. On error the
/// destination may hold a partial tree and must be treated as unusable.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<ExtractSummary, ExtractError> {
    let file = File::open(archive_path).map_err(|source| ExtractError::Open {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|source| ExtractError::Archive {
            path: archive_path.to_path_buf(),
            source,
        })?;

    fs::create_dir_all(dest).map_err(|source| write_error(dest, source))?;

    let mut summary = ExtractSummary::default();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|source| ExtractError::Entry { index, source })?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(ExtractError::UnsafePath {
                name: entry.name().to_string(),
            });
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|source| write_error(&target, source))?;
            summary.directories += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| write_error(parent, source))?;
        }
        let mut out = File::create(&target).map_err(|source| write_error(&target, source))?;
        io::copy(&mut entry, &mut out).map_err(|source| write_error(&target, source))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                .map_err(|source| write_error(&target, source))?;
        }

        summary.files += 1;
    }

    debug!(
        archive = %archive_path.display(),
        dest = %dest.display(),
        files = summary.files,
        "Extracted archive"
    );
    Ok(summary)
}

fn write_error(path: &Path, source: io::Error) -> ExtractError {
    ExtractError::Write {
        path: path.to_path_buf(),
        source,
    }
}
