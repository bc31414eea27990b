//! Cross-process file locking.
//!
//! Advisory `flock`-style exclusive locks on dedicated lock files. Every
//! writer of a shared file must go through the same lock path; readers do
//! not lock (the stores guarantee atomic writes instead).

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

use crate::domain::{CoordError, CoordResult};

/// Default acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between acquisition attempts.
const RETRY_SLEEP: Duration = Duration::from_millis(10);

/// An exclusive lock on a filesystem path, held until drop.
///
/// The lock is advisory-cooperative: it excludes other processes (and other
/// holders in this process) that acquire the same path, nothing else. Do
/// not acquire the same path twice from one task; the second acquisition
/// will spin until timeout.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire `path` exclusively, retrying until [`DEFAULT_LOCK_TIMEOUT`].
    pub fn acquire(path: impl AsRef<Path>) -> CoordResult<Self> {
        Self::acquire_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Acquire `path` exclusively, retrying with short sleeps until `timeout`.
    ///
    /// The lock file (and missing parent directories) are created on demand.
    /// Fails with [`CoordError::LockTimeout`] when the deadline passes.
    pub fn acquire_timeout(path: impl AsRef<Path>, timeout: Duration) -> CoordResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    trace!(path = %path.display(), "lock acquired");
                    return Ok(Self { file, path });
                }
                Err(_) if started.elapsed() < timeout => {
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(_) => {
                    return Err(CoordError::LockTimeout {
                        path,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Try to acquire `path` exactly once, without sleeping.
    ///
    /// Returns `Ok(None)` when another holder has the lock. Async callers
    /// use this in their own retry loop so the executor never blocks.
    pub fn try_acquire(path: impl AsRef<Path>) -> CoordResult<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlock is unconditional, including on panic unwind.
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release file lock");
        }
        trace!(path = %self.path.display(), "lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("claims.lock");

        {
            let _lock = FileLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }

        // Released on drop; a second acquisition succeeds immediately.
        let _again = FileLock::acquire(&lock_path).unwrap();
    }

    #[test]
    fn test_creates_missing_parent_dirs() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("deep/nested/state.lock");
        let _lock = FileLock::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn test_contention_times_out() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("busy.lock");

        let _held = FileLock::acquire(&lock_path).unwrap();

        let err = FileLock::acquire_timeout(&lock_path, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, CoordError::LockTimeout { .. }));
    }

    #[test]
    fn test_released_on_panic() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("panicky.lock");
        let (tx, rx) = mpsc::channel();

        let path = lock_path.clone();
        let handle = std::thread::spawn(move || {
            let _lock = FileLock::acquire(&path).unwrap();
            tx.send(()).unwrap();
            panic!("simulated worker crash");
        });

        rx.recv().unwrap();
        let _ = handle.join();

        // The unwound thread's guard must have released the lock.
        let _lock = FileLock::acquire_timeout(&lock_path, Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn test_exclusivity_across_threads() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("x.lock");

        let guard = FileLock::acquire(&lock_path).unwrap();

        let path = lock_path.clone();
        let contender = std::thread::spawn(move || {
            FileLock::acquire_timeout(&path, Duration::from_millis(30)).is_ok()
        });

        assert!(!contender.join().unwrap());
        drop(guard);
    }
}
