//! Lock-tolerant filesystem mutation.
//!
//! Deleting a directory on a desktop machine fails surprisingly often: a virus
//! scanner is reading a freshly written file, or a process that was just
//! killed has not released its handles yet. [`FsMutator`] absorbs this in two
//! tiers:
//!
//! 1. retry the removal with exponential backoff, since most locks are short;
//! 2. when the path must be free *now*, move it out of the way
//!    ([`FsMutator::force_displace`]) and reclaim the disk space later from a
//!    detached task.
//!
//! The mutator never decides whether something should be deleted, only how.

use backon::{ExponentialBuilder, Retryable};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors surfaced when a caller required the path to be gone
#[derive(Error, Debug)]
pub enum FsError {
    #[error("{path} is still locked after {attempts} attempts: {source}")]
    Locked {
        path: PathBuf,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("could not clear {path}: deletion failed and it could not be moved aside ({source})")]
    Stuck {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What happened to a path handed to the mutator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing existed at the path
    Absent,
    /// Removed synchronously
    Removed,
    /// Moved to the given location; reclaimed in the background
    Displaced(PathBuf),
    /// Still in place; a detached task keeps trying to remove it
    Deferred,
}

impl DeleteOutcome {
    /// True when the original path no longer holds anything
    pub fn path_is_free(&self) -> bool {
        !matches!(self, DeleteOutcome::Deferred)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Accept eventual, unverified cleanup instead of failing
    pub background: bool,
}

impl DeleteOptions {
    pub fn background() -> Self {
        Self { background: true }
    }
}

/// Backoff settings for removal attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total synchronous attempts, including the first one
    pub attempts: usize,
    pub initial_delay: Duration,
    pub factor: f32,
    pub max_delay: Duration,
    /// Attempts made by the detached reclaim task
    pub background_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_secs(5),
            background_attempts: 10,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempts: usize) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_factor(self.factor)
            .with_max_delay(self.max_delay)
            .with_max_times(attempts.saturating_sub(1))
    }
}

/// Primitive filesystem operations, abstracted so lock contention can be simulated
pub trait FsBackend: Send + Sync {
    /// Remove a file or a whole directory tree
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Move `from` to `to` (same semantics as `std::fs::rename`)
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Real implementation on top of `std::fs`
pub struct StdFs;

impl FsBackend for StdFs {
    fn remove(&self, path: &Path) -> io::Result<()> {
        let meta = std::fs::symlink_metadata(path)?;
        if meta.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }
}

/// Retry/displace deleter shared by the synchronizer, supervisor and build pipeline
#[derive(Clone)]
pub struct FsMutator {
    backend: Arc<dyn FsBackend>,
    policy: RetryPolicy,
    displacement_root: PathBuf,
}

impl FsMutator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_backend(Arc::new(StdFs), policy)
    }

    pub fn with_backend(backend: Arc<dyn FsBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            displacement_root: std::env::temp_dir().join("deskpack-displaced"),
        }
    }

    /// Override the OS temp location used as the first displacement target
    pub fn with_displacement_root(mut self, root: PathBuf) -> Self {
        self.displacement_root = root;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delete `path`, retrying while it is locked.
    ///
    /// In background mode an exhausted retry budget still returns `Ok`: the
    /// path is displaced if possible and the remaining work is handed to a
    /// detached task. Otherwise the last error propagates as [`FsError::Locked`].
    pub async fn delete(
        &self,
        path: &Path,
        options: DeleteOptions,
    ) -> Result<DeleteOutcome, FsError> {
        if std::fs::symlink_metadata(path).is_err() {
            return Ok(DeleteOutcome::Absent);
        }

        let attempts = self.policy.attempts.max(1);
        match remove_with_retry(
            Arc::clone(&self.backend),
            path.to_path_buf(),
            self.policy.backoff(attempts),
        )
        .await
        {
            Ok(()) => {
                debug!(path = %path.display(), "Removed");
                Ok(DeleteOutcome::Removed)
            }
            Err(source) if !options.background => Err(FsError::Locked {
                path: path.to_path_buf(),
                attempts,
                source,
            }),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Deletion still blocked, continuing in background"
                );
                if let Some(moved) = self.force_displace(path).await {
                    self.reclaim_in_background(moved.clone());
                    Ok(DeleteOutcome::Displaced(moved))
                } else {
                    self.reclaim_in_background(path.to_path_buf());
                    Ok(DeleteOutcome::Deferred)
                }
            }
        }
    }

    /// Synchronous-must-succeed clear: delete, and if the path stays locked,
    /// displace it so the caller can proceed immediately.
    pub async fn clear(&self, path: &Path) -> Result<DeleteOutcome, FsError> {
        match self.delete(path, DeleteOptions::default()).await {
            Err(FsError::Locked { source, .. }) => match self.force_displace(path).await {
                Some(moved) => {
                    self.reclaim_in_background(moved.clone());
                    Ok(DeleteOutcome::Displaced(moved))
                }
                None => Err(FsError::Stuck {
                    path: path.to_path_buf(),
                    source,
                }),
            },
            other => other,
        }
    }

    /// Move `path` out of its parent so the original location is free.
    ///
    /// Tries the OS temp location first, then a trash directory next to the
    /// parent (never inside it). Returns the new location, or `None` when both
    /// moves fail.
    pub async fn force_displace(&self, path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_string_lossy().to_string();
        let parent = path.parent()?;
        let tag = format!("{}-{}", name, Uuid::new_v4().simple());

        let temp_target = self.displacement_root.join(&tag);
        if !temp_target.starts_with(parent) {
            match self.move_into(path, &self.displacement_root, &temp_target) {
                Ok(()) => {
                    info!(from = %path.display(), to = %temp_target.display(), "Displaced locked path");
                    return Some(temp_target);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Move to temp location failed");
                }
            }
        }

        let trash_root = trash_dir_for(parent)?;
        let trash_target = trash_root.join(&tag);
        match self.move_into(path, &trash_root, &trash_target) {
            Ok(()) => {
                info!(from = %path.display(), to = %trash_target.display(), "Displaced locked path to trash");
                Some(trash_target)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not displace locked path");
                None
            }
        }
    }

    fn move_into(&self, path: &Path, root: &Path, target: &Path) -> io::Result<()> {
        std::fs::create_dir_all(root)?;
        self.backend.rename(path, target)
    }

    /// Keep trying to remove `path` from a detached task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn reclaim_in_background(&self, path: PathBuf) {
        let backend = Arc::clone(&self.backend);
        let backoff = self.policy.backoff(self.policy.background_attempts.max(1));
        tokio::spawn(async move {
            match remove_with_retry(backend, path.clone(), backoff).await {
                Ok(()) => debug!(path = %path.display(), "Background cleanup finished"),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Background cleanup gave up; path left on disk"
                ),
            }
        });
    }
}

impl Default for FsMutator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// `<grandparent>/.<parent name>-trash`, adjacent to the parent
fn trash_dir_for(parent: &Path) -> Option<PathBuf> {
    let parent_name = parent.file_name()?.to_string_lossy().to_string();
    let grandparent = parent.parent()?;
    Some(grandparent.join(format!(".{}-trash", parent_name)))
}

async fn remove_with_retry(
    backend: Arc<dyn FsBackend>,
    path: PathBuf,
    backoff: ExponentialBuilder,
) -> io::Result<()> {
    let attempt = || {
        let backend = Arc::clone(&backend);
        let path = path.clone();
        async move {
            match tokio::task::spawn_blocking(move || backend.remove(&path)).await {
                Ok(result) => result,
                Err(join) => Err(io::Error::other(join)),
            }
        }
    };

    let result = attempt
        .retry(backoff)
        .when(|e: &io::Error| e.kind() != io::ErrorKind::NotFound)
        .notify(|e: &io::Error, dur: Duration| {
            debug!(path = %path.display(), error = %e, "Removal failed, retrying after {:?}", dur);
        })
        .await;

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
