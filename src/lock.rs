//! Whole-run exclusive lock.
//!
//! One orchestrator at a time, enforced with an advisory flock on a
//! well-known file under the base directory. A second invocation sees
//! the held lock and exits instead of racing the first.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::FeedsetError;

/// Holds the run lock for the lifetime of the process; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
}

impl LockGuard {
    /// Acquire the exclusive run lock, non-blocking.
    ///
    /// Opens with create+read+write and no truncation so there is no
    /// window between creating the file and locking it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {:?}", path))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("failed to set lock file permissions")?;

        file.try_lock_exclusive()
            .map_err(|_| FeedsetError::AlreadyRunning(path.display().to_string()))?;

        Ok(Self { _file: file })
    }
}
