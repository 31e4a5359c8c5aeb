//! Content-addressed blob store.
//!
//! Stores blobs by SHA-256 digest for deduplication.
//! Directory structure: `<cas>/blobs/<first byte hex>/<full hex digest>`

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::cas::merkle::MerkleTree;
use crate::error::{io_error, not_found, ProvenanceError, Result};
use crate::hasher::{self, Digest};
use crate::utils;

/// Counters since the store was opened
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CasStats {
    pub puts: u64,
    pub dedup_hits: u64,
    pub bytes_written: u64,
}

/// Content-addressed store
pub struct ContentAddressableStore {
    /// Base store path
    store_path: PathBuf,
    /// Write lock per digest; distinct digests never contend
    write_locks: Arc<DashMap<Digest, Arc<Mutex<()>>>>,
    puts: AtomicU64,
    dedup_hits: AtomicU64,
    bytes_written: AtomicU64,
}

impl ContentAddressableStore {
    /// Open (creating if needed) a store rooted at `store_path`
    pub fn open(store_path: impl Into<PathBuf>) -> Result<Self> {
        let store_path = store_path.into();
        let blobs = store_path.join("blobs");
        fs::create_dir_all(&blobs).map_err(|e| io_error("cas_open", Some(&blobs), e))?;
        Ok(Self {
            store_path,
            write_locks: Arc::new(DashMap::new()),
            puts: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.store_path
    }

    /// Get the store path for a digest
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.store_path
            .join("blobs")
            .join(digest.shard())
            .join(digest.to_hex())
    }

    /// Store content and return its digest. Idempotent: identical bytes are written once.
    pub fn put(&self, content: &[u8]) -> Result<Digest> {
        let digest = hasher::digest(content);
        self.puts.fetch_add(1, Ordering::Relaxed);

        let lock = self
            .write_locks
            .entry(digest)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.write_blob(&digest, content)
        };
        drop(lock);
        self.write_locks
            .remove_if(&digest, |_, l| Arc::strong_count(l) == 1);
        result.map(|_| digest)
    }

    fn write_blob(&self, digest: &Digest, content: &[u8]) -> Result<()> {
        let store_path = self.blob_path(digest);
        if store_path.exists() {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let shard_dir = store_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.store_path.join("blobs"));
        fs::create_dir_all(&shard_dir).map_err(|e| io_error("cas_put", Some(&shard_dir), e))?;

        // Atomic write: write to temp file, then rename
        let temp_path = shard_dir.join(format!("{}.tmp-{}", digest.to_hex(), utils::random_hex(4)));
        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&temp_path, &store_path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error("cas_put", Some(&store_path), e));
        }

        self.bytes_written
            .fetch_add(content.len() as u64, Ordering::Relaxed);
        utils::log(&format!("cas: stored {} ({} bytes)", digest, content.len()));
        Ok(())
    }

    /// Read content by digest; the bytes are re-hashed before they are returned.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(not_found("cas_get", digest.to_hex()));
            }
            Err(e) => return Err(io_error("cas_get", Some(&path), e)),
        };
        let actual = hasher::digest(&content);
        if actual != *digest {
            utils::log_error(&format!("cas: blob {} hashes to {}", digest, actual));
            return Err(ProvenanceError::IntegrityViolation {
                operation: "cas_get".to_string(),
                subject: format!("blob {}", path.display()),
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(content)
    }

    /// Check if content exists in store
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Stored size in bytes
    pub fn size(&self, digest: &Digest) -> Result<u64> {
        let path = self.blob_path(digest);
        match fs::metadata(&path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found("cas_size", digest.to_hex())),
            Err(e) => Err(io_error("cas_size", Some(&path), e)),
        }
    }

    /// All stored digests, sorted. Temp files and stray names are skipped.
    pub fn list(&self) -> Result<Vec<Digest>> {
        let blobs = self.store_path.join("blobs");
        let mut out = Vec::new();
        let shards = fs::read_dir(&blobs).map_err(|e| io_error("cas_list", Some(&blobs), e))?;
        for shard in shards.flatten() {
            if !shard.path().is_dir() {
                continue;
            }
            let entries =
                fs::read_dir(shard.path()).map_err(|e| io_error("cas_list", Some(&shard.path()), e))?;
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Ok(d) = Digest::from_hex(&name.to_string_lossy()) {
                    out.push(d);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Re-hash every stored blob; returns the digests whose bytes no longer match. Never repairs.
    pub fn verify_all(&self) -> Result<Vec<Digest>> {
        let digests = self.list()?;
        let mut corrupt: Vec<Digest> = digests
            .par_iter()
            .filter(|d| match self.get(d) {
                Ok(_) => false,
                Err(e) => e.is_integrity(),
            })
            .copied()
            .collect();
        corrupt.sort();
        for d in &corrupt {
            utils::log_error(&format!("cas: audit found corrupt blob {}", d));
        }
        Ok(corrupt)
    }

    /// Build a Merkle tree over `(name, digest)` leaves. Order of `leaves` does not matter.
    pub fn build_merkle(&self, leaves: &[(String, Digest)]) -> Result<MerkleTree> {
        MerkleTree::build(leaves.to_vec())
    }

    pub fn stats(&self) -> CasStats {
        CasStats {
            puts: self.puts.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ContentAddressableStore) {
        let dir = tempfile::tempdir().unwrap();
        let cas = ContentAddressableStore::open(dir.path().join("cas")).unwrap();
        (dir, cas)
    }

    #[test]
    fn test_put_get() {
        let (_dir, cas) = store();
        let d = cas.put(b"hello").unwrap();
        assert_eq!(d, hasher::digest(b"hello"));
        assert_eq!(cas.get(&d).unwrap(), b"hello");
        assert!(cas.contains(&d));
        assert_eq!(cas.size(&d).unwrap(), 5);
    }

    #[test]
    fn test_identical_bytes_stored_once() {
        let (_dir, cas) = store();
        let a = cas.put(b"same bytes").unwrap();
        let b = cas.put(b"same bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(cas.list().unwrap(), vec![a]);
        let stats = cas.stats();
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.dedup_hits, 1);
        assert_eq!(stats.bytes_written, 10);
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let (_dir, cas) = store();
        let err = cas.get(&hasher::digest(b"never stored")).unwrap_err();
        assert!(matches!(err, ProvenanceError::NotFound { .. }));
    }

    #[test]
    fn test_corrupted_blob_is_integrity_violation() {
        let (_dir, cas) = store();
        let d = cas.put(b"original").unwrap();
        fs::write(cas.blob_path(&d), b"tampered").unwrap();
        let err = cas.get(&d).unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(cas.verify_all().unwrap(), vec![d]);
    }

    #[test]
    fn test_concurrent_puts_of_same_content() {
        let (_dir, cas) = store();
        let cas = Arc::new(cas);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cas = Arc::clone(&cas);
                std::thread::spawn(move || cas.put(b"contended").unwrap())
            })
            .collect();
        let digests: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cas.list().unwrap().len(), 1);
        assert_eq!(cas.stats().bytes_written, 9);
    }

    #[test]
    fn test_build_merkle_ignores_input_order() {
        let (_dir, cas) = store();
        let a = ("a.txt".to_string(), cas.put(b"a").unwrap());
        let b = ("b.txt".to_string(), cas.put(b"b").unwrap());
        let r1 = cas.build_merkle(&[a.clone(), b.clone()]).unwrap().root();
        let r2 = cas.build_merkle(&[b, a]).unwrap().root();
        assert_eq!(r1, r2);
    }
}
