//! Persistence adapters for blackboard snapshots.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::blackboard::crdt::{BlackboardSnapshot, JoinSemilattice};
use crate::config::DEFAULT_LOCK_TIMEOUT_MS;
use crate::error::{io_error, serde_error, Result};
use crate::lock::FileLock;
use crate::utils;

pub trait SnapshotStore: Send + Sync {
    /// Missing state loads as the empty snapshot.
    fn load(&self) -> Result<BlackboardSnapshot>;
    fn save(&self, snapshot: &BlackboardSnapshot) -> Result<()>;

    /// Join `local` into the persisted state and return what was written.
    /// Other writers' updates survive because the write is a join, never a replace.
    fn sync(&self, local: &BlackboardSnapshot) -> Result<BlackboardSnapshot> {
        let merged = self.load()?.join(local);
        self.save(&merged)?;
        Ok(merged)
    }
}

/// Pretty JSON file, replaced atomically on every save.
/// `sync` holds `<path>.lock` across the read-join-write cycle.
pub struct JsonFileStore {
    path: PathBuf,
    lock: FileLock,
    lock_timeout: Duration,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = FileLock::new(PathBuf::from(format!("{}.lock", path.display())));
        Self {
            path,
            lock,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<BlackboardSnapshot> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BlackboardSnapshot::default()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| serde_error("blackboard_load", e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BlackboardSnapshot::default()),
            Err(e) => Err(io_error("blackboard_load", Some(&self.path), e)),
        }
    }

    fn save(&self, snapshot: &BlackboardSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| serde_error("blackboard_save", e))?;
        utils::write_atomic(&self.path, &body)
    }

    fn sync(&self, local: &BlackboardSnapshot) -> Result<BlackboardSnapshot> {
        let _guard = self.lock.acquire(self.lock_timeout)?;
        let merged = self.load()?.join(local);
        self.save(&merged)?;
        Ok(merged)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<BlackboardSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<BlackboardSnapshot> {
        Ok(self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, snapshot: &BlackboardSnapshot) -> Result<()> {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = snapshot.clone();
        Ok(())
    }

    fn sync(&self, local: &BlackboardSnapshot) -> Result<BlackboardSnapshot> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *inner = inner.join(local);
        Ok(inner.clone())
    }
}
