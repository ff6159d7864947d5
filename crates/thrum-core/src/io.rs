//! Advisory file locking with backoff retry.
//!
//! Used to scope the event-store append (spec.md §4.1: "an advisory file
//! lock held only for the append") and the sync engine's single
//! `sync.lock` (spec.md §4.7).

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("io error locking {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to acquire lock on {path} after {retries} retries")]
    Timeout { path: PathBuf, retries: u32 },
}

/// File lock guard; releases the lock on drop.
pub struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquires an exclusive lock on `path`, creating it if necessary, with
/// exponential backoff: attempt 0 no wait, then 50ms, 100ms, 200ms, ...
pub fn acquire_lock(path: &Path, max_retries: u32) -> Result<FileLock, LockError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

    for attempt in 0..=max_retries {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(FileLock { file }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if attempt < max_retries {
                    let wait_ms = 50u64 * (1 << attempt.min(10));
                    std::thread::sleep(Duration::from_millis(wait_ms));
                }
            }
            Err(e) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }

    Err(LockError::Timeout {
        path: path.to_path_buf(),
        retries: max_retries,
    })
}

/// Attempts to acquire the lock exactly once, no retry/backoff. Used by the
/// supervisor singleton check (spec.md §4.8) where "already running" must
/// be reported immediately rather than after a multi-second backoff.
pub fn try_acquire_lock_once(path: &Path) -> Result<FileLock, LockError> {
    acquire_lock(path, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn acquire_then_release_then_reacquire() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("test.lock");

        {
            let _lock = acquire_lock(&lock_path, 5).unwrap();
        }
        let _lock2 = acquire_lock(&lock_path, 5).unwrap();
    }

    #[test]
    fn concurrent_acquire_waits_for_release() {
        let tmp = TempDir::new().unwrap();
        let lock_path = Arc::new(tmp.path().join("test.lock"));
        let barrier = Arc::new(Barrier::new(2));

        let lp1 = Arc::clone(&lock_path);
        let b1 = Arc::clone(&barrier);
        let h1 = thread::spawn(move || {
            let _lock = acquire_lock(&lp1, 5).unwrap();
            b1.wait();
            thread::sleep(Duration::from_millis(100));
        });

        barrier.wait();
        let result = acquire_lock(&lock_path, 5);
        h1.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn second_lock_in_same_process_times_out_while_held() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("sync.lock");
        let _held = acquire_lock(&lock_path, 0).unwrap();
        let result = try_acquire_lock_once(&lock_path);
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }
}
