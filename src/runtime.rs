//! Runtime roots: the directory tree a spawned interpreter actually serves.
//!
//! Ephemeral roots are unique per process and deleted on shutdown.
//! Persistent roots live in user data and carry a version marker so an
//! unchanged installation skips the copy entirely.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::fsops::{DeleteOptions, DeleteOutcome, FsMutator};

/// Plain-text file inside a persistent root holding the last synced version
pub const MARKER_FILE: &str = ".runtime-version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Ephemeral,
    Persistent,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("runtime source {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("failed to create runtime root {path}: {source}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to update version marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file that could not be copied; the rest of the sync carried on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub copied: usize,
    pub directories: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub enum SyncOutcome {
    /// Marker already matched; nothing was copied
    UpToDate,
    Synced(SyncReport),
}

/// Mirror `source` into `dest`, creating directories and overwriting files.
///
/// A file that cannot be copied (typically a log still locked by a previous
/// run) is recorded in the report and skipped.
pub fn sync_tree(source: &Path, dest: &Path) -> Result<SyncReport, SyncError> {
    if !source.is_dir() {
        return Err(SyncError::SourceMissing(source.to_path_buf()));
    }
    fs::create_dir_all(dest).map_err(|source| SyncError::CreateRoot {
        path: dest.to_path_buf(),
        source,
    })?;

    let mut report = SyncReport::default();
    for entry in WalkDir::new(source).min_depth(1).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                warn!(path = %path.display(), error = %e, "Skipping unreadable source entry");
                report.failures.push(SyncFailure {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);

        let result = if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map(|()| report.directories += 1)
        } else {
            copy_file(entry.path(), &target).map(|()| report.copied += 1)
        };

        if let Err(e) = result {
            warn!(
                path = %target.display(),
                error = %e,
                "Failed to sync runtime file, continuing"
            );
            report.failures.push(SyncFailure {
                path: target,
                reason: e.to_string(),
            });
        }
    }

    debug!(
        source = %source.display(),
        dest = %dest.display(),
        copied = report.copied,
        failed = report.failures.len(),
        "Runtime tree synced"
    );
    Ok(report)
}

fn copy_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to).map(|_| ())
}

#[derive(Debug, Clone)]
pub struct RuntimeRoot {
    path: PathBuf,
    mode: RuntimeMode,
    version: String,
}

impl RuntimeRoot {
    /// A fresh root under `base`, unique to this process instance
    pub fn ephemeral(base: &Path, app: &str, version: &str) -> Self {
        let name = format!(
            "{}-runtime-{}-{}",
            app,
            std::process::id(),
            Uuid::new_v4().simple()
        );
        Self {
            path: base.join(name),
            mode: RuntimeMode::Ephemeral,
            version: version.to_string(),
        }
    }

    /// The shared root inside the application's user-data directory
    pub fn persistent(user_data: &Path, version: &str) -> Self {
        Self {
            path: user_data.join("runtime"),
            mode: RuntimeMode::Persistent,
            version: version.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn marker_path(&self) -> PathBuf {
        self.path.join(MARKER_FILE)
    }

    /// Version recorded by the last performed sync, if any
    pub fn recorded_version(&self) -> Option<String> {
        fs::read_to_string(self.marker_path())
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn needs_sync(&self) -> bool {
        match self.mode {
            RuntimeMode::Ephemeral => true,
            RuntimeMode::Persistent => {
                self.recorded_version().as_deref() != Some(self.version.as_str())
            }
        }
    }

    /// Bring the root up to date with `source`.
    ///
    /// Persistent roots are skipped when the marker matches. The marker is
    /// removed before copying and rewritten once the copy has run, so only an
    /// interrupted sync is retried on the next launch. Files that could not be
    /// copied are reported in the returned [`SyncReport`].
    pub fn sync(&self, source: &Path) -> Result<SyncOutcome, SyncError> {
        if !self.needs_sync() {
            debug!(root = %self.path.display(), version = %self.version, "Runtime root up to date");
            return Ok(SyncOutcome::UpToDate);
        }

        let marker = self.marker_path();
        if self.mode == RuntimeMode::Persistent {
            remove_marker(&marker)?;
        }

        let report = sync_tree(source, &self.path)?;

        if self.mode == RuntimeMode::Persistent {
            fs::write(&marker, &self.version).map_err(|source| SyncError::Marker {
                path: marker.clone(),
                source,
            })?;
        }
        if !report.is_complete() {
            warn!(
                root = %self.path.display(),
                failed = report.failures.len(),
                "Runtime root synced with skipped files"
            );
        }

        info!(
            root = %self.path.display(),
            mode = ?self.mode,
            copied = report.copied,
            "Runtime root synced"
        );
        Ok(SyncOutcome::Synced(report))
    }

    /// Best-effort removal of an ephemeral root; persistent roots are kept.
    pub async fn cleanup(&self, mutator: &FsMutator) -> Option<DeleteOutcome> {
        if self.mode != RuntimeMode::Ephemeral {
            return None;
        }
        match mutator
            .delete(&self.path, DeleteOptions::background())
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(root = %self.path.display(), error = %e, "Ephemeral runtime cleanup failed");
                None
            }
        }
    }
}

fn remove_marker(marker: &Path) -> Result<(), SyncError> {
    match fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SyncError::Marker {
            path: marker.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsops::tests::fast_policy;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn source_tree(root: &Path) -> PathBuf {
        let source = root.join("app");
        fs::create_dir_all(source.join("assets").join("css")).unwrap();
        fs::write(source.join("index.php"), "<?php echo 'hi';").unwrap();
        fs::write(source.join("assets").join("css").join("site.css"), "body{}").unwrap();
        fs::create_dir_all(source.join("empty")).unwrap();
        source
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                (
                    e.path().strip_prefix(root).unwrap().to_path_buf(),
                    fs::read(e.path()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_sync_tree_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let source = source_tree(temp.path());
        let dest = temp.path().join("runtime");

        let first = sync_tree(&source, &dest).unwrap();
        let after_one = snapshot(&dest);
        sync_tree(&source, &dest).unwrap();

        assert_eq!(first.copied, 2);
        assert!(dest.join("empty").is_dir());
        assert_eq!(after_one, snapshot(&dest));
        assert_eq!(after_one, snapshot(&source));
    }

    #[test]
    fn test_sync_tree_overwrites_changed_files() {
        let temp = TempDir::new().unwrap();
        let source = source_tree(temp.path());
        let dest = temp.path().join("runtime");
        sync_tree(&source, &dest).unwrap();

        fs::write(source.join("index.php"), "<?php echo 'v2';").unwrap();
        sync_tree(&source, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("index.php")).unwrap(),
            "<?php echo 'v2';"
        );
    }

    #[test]
    fn test_sync_tree_skips_failed_files() {
        let temp = TempDir::new().unwrap();
        let source = source_tree(temp.path());
        let dest = temp.path().join("runtime");
        // A directory where a file must go cannot be overwritten by a copy
        fs::create_dir_all(dest.join("index.php")).unwrap();

        let report = sync_tree(&source, &dest).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, dest.join("index.php"));
        assert!(dest.join("assets").join("css").join("site.css").is_file());
    }

    #[test]
    fn test_sync_tree_missing_source() {
        let temp = TempDir::new().unwrap();
        let err = sync_tree(&temp.path().join("nope"), &temp.path().join("dest")).unwrap_err();
        assert!(matches!(err, SyncError::SourceMissing(_)));
    }

    #[test]
    fn test_persistent_root_version_gating() {
        let temp = TempDir::new().unwrap();
        let source = source_tree(temp.path());
        let user_data = temp.path().join("user-data");

        let v1 = RuntimeRoot::persistent(&user_data, "1.0.0");
        assert!(v1.needs_sync());
        assert!(matches!(v1.sync(&source).unwrap(), SyncOutcome::Synced(_)));
        assert_eq!(v1.recorded_version().as_deref(), Some("1.0.0"));

        // Same version: nothing is copied, even if the source changed
        fs::write(source.join("index.php"), "changed").unwrap();
        assert!(matches!(v1.sync(&source).unwrap(), SyncOutcome::UpToDate));
        assert_ne!(
            fs::read_to_string(v1.path().join("index.php")).unwrap(),
            "changed"
        );

        let v2 = RuntimeRoot::persistent(&user_data, "1.1.0");
        assert!(v2.needs_sync());
        assert!(matches!(v2.sync(&source).unwrap(), SyncOutcome::Synced(_)));
        assert_eq!(v2.recorded_version().as_deref(), Some("1.1.0"));
        assert_eq!(
            fs::read_to_string(v2.path().join("index.php")).unwrap(),
            "changed"
        );
    }

    #[test]
    fn test_partial_sync_still_records_version() {
        let temp = TempDir::new().unwrap();
        let source = source_tree(temp.path());
        let root = RuntimeRoot::persistent(&temp.path().join("user-data"), "2.0.0");
        fs::create_dir_all(root.path().join("index.php")).unwrap();

        let SyncOutcome::Synced(report) = root.sync(&source).unwrap() else {
            panic!("expected a sync");
        };
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, root.path().join("index.php"));
        assert_eq!(root.recorded_version().as_deref(), Some("2.0.0"));
        assert!(!root.needs_sync());
        assert!(matches!(root.sync(&source).unwrap(), SyncOutcome::UpToDate));
    }

    #[test]
    fn test_ephemeral_roots_are_unique_and_always_sync() {
        let temp = TempDir::new().unwrap();
        let a = RuntimeRoot::ephemeral(temp.path(), "deskpack", "1.0.0");
        let b = RuntimeRoot::ephemeral(temp.path(), "deskpack", "1.0.0");
        assert_ne!(a.path(), b.path());
        assert!(a
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("deskpack-runtime-{}-", std::process::id())));

        let source = source_tree(temp.path());
        a.sync(&source).unwrap();
        assert!(a.needs_sync());
        assert!(!a.marker_path().exists());
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_ephemeral_roots() {
        let temp = TempDir::new().unwrap();
        let source = source_tree(temp.path());
        let mutator = FsMutator::new(fast_policy());

        let ephemeral = RuntimeRoot::ephemeral(temp.path(), "deskpack", "1.0.0");
        ephemeral.sync(&source).unwrap();
        let outcome = ephemeral.cleanup(&mutator).await;
        assert_eq!(outcome, Some(DeleteOutcome::Removed));
        assert!(!ephemeral.path().exists());

        let persistent = RuntimeRoot::persistent(&temp.path().join("data"), "1.0.0");
        persistent.sync(&source).unwrap();
        assert_eq!(persistent.cleanup(&mutator).await, None);
        assert!(persistent.path().exists());
    }
}
