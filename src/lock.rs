//! Single-run guard.
//!
//! Two loops running against the same working tree would corrupt each
//! other's fingerprints. A run holds an advisory exclusive lock on
//! `codex_loop.lock` in its log directory until the guard is dropped.

use crate::error::{LoopError, Result};
use anyhow::Context;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the lock file inside the log directory.
pub const LOCK_FILE_NAME: &str = "codex_loop.lock";

/// Held lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock in `log_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// `LoopError::AlreadyRunning` if another process holds the lock.
    pub fn acquire(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let path = log_dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open run lock {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(LoopError::AlreadyRunning { path });
        }

        // Informational only; the lock itself is what matters.
        if let Err(e) = file.set_len(0).and_then(|()| writeln!(file, "{}", std::process::id())) {
            warn!("Failed to record pid in {}: {}", path.display(), e);
        }
        debug!("Acquired run lock {}", path.display());
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp = TempDir::new().unwrap();
        let first = RunLock::acquire(temp.path()).unwrap();
        assert!(first.path().ends_with(LOCK_FILE_NAME));

        let err = RunLock::acquire(temp.path()).unwrap_err();
        assert!(matches!(err, LoopError::AlreadyRunning { .. }));
        assert_eq!(err.exit_code(), 8);
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp = TempDir::new().unwrap();
        drop(RunLock::acquire(temp.path()).unwrap());
        assert!(RunLock::acquire(temp.path()).is_ok());
    }

    #[test]
    fn test_log_dir_creation_failure_names_path() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "file in the way").unwrap();
        let log_dir = blocker.join("logs");

        let err = RunLock::acquire(&log_dir).unwrap_err();
        assert!(matches!(err, LoopError::Other(_)));
        let message = format!("{err:#}");
        assert!(message.contains("Failed to create log directory"));
        assert!(message.contains(&log_dir.display().to_string()));
    }

    #[test]
    fn test_creates_missing_log_dir() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/c");
        let lock = RunLock::acquire(&nested).unwrap();
        assert!(lock.path().exists());
    }
}
