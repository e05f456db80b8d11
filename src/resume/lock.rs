//! Exclusive ownership of an output file
//!
//! Advisory locking with fd-lock on `<output>.lock`, so two processes never
//! append to the same output file.

use super::ResumeError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held for the lifetime of a job run
pub struct ResumeLock {
    _lock: RwLock<File>,
    path: PathBuf,
}

impl ResumeLock {
    /// Lock file path for `output`
    pub fn lock_path(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Try to take the lock for `output` without blocking.
    ///
    /// Fails with [`ResumeError::JobLocked`] while another process holds it.
    pub fn try_acquire(output: &Path) -> Result<Self, ResumeError> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
        }

        let path = Self::lock_path(output);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ResumeError::LockError(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        let guard = lock
            .try_write()
            .map_err(|_| ResumeError::JobLocked { path: path.clone() })?;
        // the flock lives as long as the file handle
        std::mem::forget(guard);

        debug!(path = %path.display(), "Acquired output lock");
        Ok(Self { _lock: lock, path })
    }

    /// Lock file in use
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ResumeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeLock").field("path", &self.path).finish()
    }
}
