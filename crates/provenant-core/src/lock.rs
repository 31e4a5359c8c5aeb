//! Cross-process lock: a lock file created with `create_new`.
//! Guards ledger appends and blackboard read-join-write cycles.
//! Contention is retried with exponential backoff until the timeout.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::error::{io_error, ProvenanceError, Result};
use crate::utils;

/// A lock file older than this is assumed to belong to a dead writer.
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct FileLock {
    path: PathBuf,
}

/// Removes the lock file on drop.
pub(crate) struct LockGuard {
    path: PathBuf,
}

/// Outcome of one attempt. `Conflict` never leaves this module.
enum Attempt {
    Acquired(LockGuard),
    Conflict,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(1);
        loop {
            match self.try_acquire()? {
                Attempt::Acquired(guard) => return Ok(guard),
                Attempt::Conflict => {
                    if self.break_if_stale() {
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        return Err(ProvenanceError::WriteFailure {
                            operation: "file_lock".to_string(),
                            path: Some(self.path.display().to_string()),
                            source: format!("lock still held after {}ms", timeout.as_millis()),
                        });
                    }
                    thread::sleep(delay);
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn try_acquire(&self) -> Result<Attempt> {
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Attempt::Acquired(LockGuard { path: self.path.clone() }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(Attempt::Conflict),
            Err(e) => Err(io_error("file_lock", Some(&self.path), e)),
        }
    }

    fn break_if_stale(&self) -> bool {
        let age = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());
        match age {
            Some(age) if age > STALE_LOCK_AFTER => {
                utils::log(&format!(
                    "lock: breaking stale lock {} ({}s old)",
                    self.path.display(),
                    age.as_secs()
                ));
                fs::remove_file(&self.path).is_ok()
            }
            _ => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("l.lock"));
        {
            let _g = lock.acquire(Duration::from_millis(100)).unwrap();
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("l.lock"));
        let _held = lock.acquire(Duration::from_millis(100)).unwrap();
        let err = lock.acquire(Duration::from_millis(20)).err().unwrap();
        assert!(matches!(err, ProvenanceError::WriteFailure { .. }));
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.lock");
        let lock = FileLock::new(&path);
        let held = lock.acquire(Duration::from_millis(100)).unwrap();
        let waiter = {
            let path = path.clone();
            thread::spawn(move || FileLock::new(path).acquire(Duration::from_secs(5)).is_ok())
        };
        thread::sleep(Duration::from_millis(30));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
