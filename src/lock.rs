//! Run-level mutual exclusion.
//!
//! At most one process ticks a given run at a time. The default
//! implementation takes a non-blocking advisory lock on `<root>/run.lock`;
//! the lock is released when the guard drops, on every exit path.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::errors::LockError;

/// Non-blocking exclusive lock over one run.
pub trait RunLock {
    type Guard;

    /// Take the lock or fail immediately with [`LockError::Contention`].
    fn try_acquire(&self) -> Result<Self::Guard, LockError>;
}

/// Advisory lock backed by a sentinel file.
#[derive(Debug, Clone)]
pub struct FileRunLock {
    path: PathBuf,
}

impl FileRunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunLock for FileRunLock {
    type Guard = RunLockGuard;

    fn try_acquire(&self) -> Result<RunLockGuard, LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::trace!(path = %self.path.display(), "run lock acquired");
                Ok(RunLockGuard {
                    file,
                    path: self.path.clone(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::Contention {
                    path: self.path.clone(),
                })
            }
            Err(e) => Err(io_err(e)),
        }
    }
}

/// Held lock; dropping it releases the lock.
#[derive(Debug)]
pub struct RunLockGuard {
    file: File,
    path: PathBuf,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_contention() {
        let dir = tempdir().unwrap();
        let lock = FileRunLock::new(dir.path().join("run.lock"));
        let guard = lock.try_acquire().unwrap();
        assert!(lock.path().exists());

        let other = FileRunLock::new(dir.path().join("run.lock"));
        let err = other.try_acquire().unwrap_err();
        assert!(err.is_contention());
        assert!(matches!(err, LockError::Contention { .. }));

        drop(guard);
        assert!(other.try_acquire().is_ok());
    }

    #[test]
    fn test_released_when_scope_unwinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let result = std::panic::catch_unwind(|| {
            let _guard = FileRunLock::new(&path).try_acquire().unwrap();
            panic!("tick blew up");
        });
        assert!(result.is_err());
        assert!(FileRunLock::new(&path).try_acquire().is_ok());
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = tempdir().unwrap();
        let lock = FileRunLock::new(dir.path().join("missing").join("run.lock"));
        let err = lock.try_acquire().unwrap_err();
        assert!(!err.is_contention());
    }
}
