//! Boundary surface: the operations collaborators call.
//!
//! `Vault` wires the CAS, ledger, archiver and blackboard together and owns the
//! ordering that makes `store_capsule` all-or-nothing from a reader's view:
//! nothing claims success until the `capsule_created` ledger entry is committed.

use std::collections::BTreeMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::archive::{self, Archive, Archiver, Capsule, FileCheck};
use crate::blackboard::{
    self, Blackboard, BlackboardSnapshot, JsonFileStore, SnapshotStore, PENDING,
};
use crate::cas::ContentAddressableStore;
use crate::config::Config;
use crate::error::{invalid_input, io_error, not_found, ProvenanceError, Result};
use crate::hasher::Digest;
use crate::ledger::{EventType, Ledger, LedgerEntry, ValidationResult};
use crate::utils;

/// What a successful `store_capsule` produced
#[derive(Clone, Debug, Serialize)]
pub struct StoreReceipt {
    pub archive: Archive,
    pub ledger_entry: LedgerEntry,
    /// Non-fatal problems with derived state (blackboard persistence)
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapsuleRef {
    Id(String),
    Path(PathBuf),
}

impl CapsuleRef {
    /// An existing file is an archive path; anything else is a capsule id.
    pub fn parse(raw: &str) -> Self {
        let path = Path::new(raw);
        if path.is_file() {
            CapsuleRef::Path(path.to_path_buf())
        } else {
            CapsuleRef::Id(raw.to_string())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub capsule_id: String,
    pub archive_path: PathBuf,
    pub merkle_root: Digest,
    pub files: Vec<FileCheck>,
    pub merkle_root_matches: bool,
    pub digests_match: bool,
    /// Whether a `capsule_created` entry names this archive
    pub ledger_recorded: bool,
    /// Recorded root equals the manifest root; None when not recorded
    pub ledger_root_matches: Option<bool>,
    pub valid: bool,
}

pub struct Vault {
    config: Config,
    cas: Arc<ContentAddressableStore>,
    ledger: Ledger,
    archiver: Archiver,
    blackboard: Mutex<Blackboard>,
    snapshot_store: Box<dyn SnapshotStore>,
}

impl Vault {
    /// Open every component under `config.root`, creating directories as needed.
    pub fn open(config: Config) -> Result<Self> {
        let store = JsonFileStore::new(config.blackboard_path()).with_lock_timeout(config.lock_timeout);
        Self::with_store(config, Box::new(store))
    }

    pub fn with_store(config: Config, snapshot_store: Box<dyn SnapshotStore>) -> Result<Self> {
        fs::create_dir_all(&config.root).map_err(|e| io_error("vault_open", Some(&config.root), e))?;
        let cas = Arc::new(ContentAddressableStore::open(config.cas_dir())?);
        let ledger = Ledger::open(config.ledger_path(), config.lock_timeout)?;
        let archiver = Archiver::new(config.archive_dir(), Arc::clone(&cas))?;
        let blackboard = Blackboard::from_snapshot(config.writer_id.clone(), snapshot_store.load()?);
        Ok(Self {
            config,
            cas,
            ledger,
            archiver,
            blackboard: Mutex::new(blackboard),
            snapshot_store,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cas(&self) -> &ContentAddressableStore {
        &self.cas
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    pub fn append_event(&self, event_type: EventType, payload: Value) -> Result<LedgerEntry> {
        self.ledger.append(event_type, payload)
    }

    /// Persist a capsule: CAS put, Merkle build, staged archive, promotion,
    /// `capsule_created` ledger entry, then blackboard reinjection state.
    pub fn store_capsule(
        &self,
        capsule_id: &str,
        primary: &[u8],
        files: &BTreeMap<String, Vec<u8>>,
        metadata: Value,
    ) -> Result<StoreReceipt> {
        let archive = match self.seal_capsule(capsule_id, primary, files, metadata.clone()) {
            Ok(a) => a,
            Err(e) => {
                self.record_failure(capsule_id, &e);
                return Err(e);
            }
        };

        let files_map: BTreeMap<&str, String> = archive
            .manifest
            .files
            .iter()
            .filter_map(|f| {
                f.name
                    .strip_prefix(archive::FILES_PREFIX)
                    .map(|name| (name, f.digest.to_hex()))
            })
            .collect();
        let primary_digest = archive
            .manifest
            .files
            .iter()
            .find(|f| f.name == archive::PRIMARY_NAME)
            .map(|f| f.digest.to_hex())
            .unwrap_or_default();
        let payload = json!({
            "capsule_id": capsule_id,
            "primary_digest": primary_digest,
            "files": files_map,
            "merkle_root": archive.manifest.merkle_root.to_hex(),
            "archive_path": archive.archive_path.display().to_string(),
            "metadata": metadata,
        });

        let entry = match self.ledger.append(EventType::CapsuleCreated, payload) {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(rollback) = self.archiver.discard(&archive) {
                    utils::log_error(&format!(
                        "vault: could not roll back archive for {}: {}",
                        capsule_id, rollback
                    ));
                }
                self.record_failure(capsule_id, &e);
                return Err(e);
            }
        };

        let mut warnings = Vec::new();
        if let Err(e) = self.reinject(capsule_id, &archive, &primary_digest) {
            utils::log_error(&format!("vault: blackboard update for {} failed: {}", capsule_id, e));
            warnings.push(format!("blackboard not persisted: {}", e));
        }

        Ok(StoreReceipt { archive, ledger_entry: entry, warnings })
    }

    fn seal_capsule(
        &self,
        capsule_id: &str,
        primary: &[u8],
        files: &BTreeMap<String, Vec<u8>>,
        metadata: Value,
    ) -> Result<Archive> {
        if capsule_id.trim().is_empty() {
            return Err(invalid_input("store_capsule", "capsule_id must not be empty"));
        }
        for name in files.keys() {
            archive::validate_file_name(name)?;
        }

        let primary_payload_digest = self.cas.put(primary)?;
        let mut associated_files = BTreeMap::new();
        for (name, bytes) in files {
            associated_files.insert(name.clone(), self.cas.put(bytes)?);
        }
        let capsule = Capsule {
            capsule_id: capsule_id.to_string(),
            primary_payload_digest,
            associated_files,
            metadata,
        };

        let tree = self.cas.build_merkle(&capsule.members())?;
        let staged = self.archiver.stage(&capsule)?;
        if staged.manifest().merkle_root != tree.root() {
            return Err(ProvenanceError::IntegrityViolation {
                operation: "store_capsule".to_string(),
                subject: format!("manifest root for {}", capsule_id),
                expected: tree.root().to_hex(),
                actual: staged.manifest().merkle_root.to_hex(),
            });
        }
        staged.promote()
    }

    fn record_failure(&self, capsule_id: &str, err: &ProvenanceError) {
        let payload = json!({
            "capsule_id": capsule_id,
            "error_kind": err.kind(),
            "error": err.to_string(),
        });
        if let Err(e) = self.ledger.append(EventType::CapsuleFailed, payload) {
            utils::log_error(&format!("vault: could not record failure for {}: {}", capsule_id, e));
        }
    }

    fn reinject(&self, capsule_id: &str, archive: &Archive, primary_digest: &str) -> Result<()> {
        let mut bb = self.blackboard.lock().unwrap_or_else(|p| p.into_inner());
        bb.set(
            &blackboard::capsule_key(capsule_id),
            json!({
                "archive_path": archive.archive_path.display().to_string(),
                "merkle_root": archive.manifest.merkle_root.to_hex(),
                "primary_digest": primary_digest,
            }),
        );
        bb.add_presence(&blackboard::reinject_key(capsule_id), PENDING);
        self.persist(&mut bb)
    }

    /// Join local state into the persisted snapshot, then fold the result back
    /// so this handle also sees what other handles wrote since it opened.
    fn persist(&self, bb: &mut Blackboard) -> Result<()> {
        let persisted = self.snapshot_store.sync(&bb.snapshot())?;
        bb.absorb(&persisted);
        Ok(())
    }

    fn refresh(&self, bb: &mut Blackboard) -> Result<()> {
        let persisted = self.snapshot_store.load()?;
        bb.absorb(&persisted);
        Ok(())
    }

    /// Re-hash an archive and check it against its manifest and the ledger. Read-only.
    pub fn verify_capsule(&self, target: &CapsuleRef) -> Result<VerificationReport> {
        let (archive_path, recorded) = match target {
            CapsuleRef::Id(id) => {
                let entry = self
                    .ledger
                    .find_latest(EventType::CapsuleCreated, |p| {
                        p.get("capsule_id").and_then(Value::as_str) == Some(id.as_str())
                    })?
                    .ok_or_else(|| not_found("verify_capsule", id.clone()))?;
                let path = entry
                    .payload
                    .get("archive_path")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
                    .ok_or_else(|| ProvenanceError::IntegrityViolation {
                        operation: "verify_capsule".to_string(),
                        subject: format!("ledger entry #{}", entry.sequence),
                        expected: "archive_path".to_string(),
                        actual: "missing".to_string(),
                    })?;
                (path, Some(entry))
            }
            CapsuleRef::Path(path) => {
                let target = canonical(path);
                let entry = self.ledger.find_latest(EventType::CapsuleCreated, |p| {
                    p.get("archive_path")
                        .and_then(Value::as_str)
                        .map(|recorded| canonical(Path::new(recorded)) == target)
                        .unwrap_or(false)
                })?;
                (path.clone(), entry)
            }
        };

        let report = self.archiver.inspect(&archive_path)?;
        let ledger_root_matches = recorded.as_ref().map(|entry| {
            entry.payload.get("merkle_root").and_then(Value::as_str)
                == Some(report.manifest.merkle_root.to_hex().as_str())
        });
        let valid = report.is_valid() && ledger_root_matches != Some(false);

        Ok(VerificationReport {
            capsule_id: report.manifest.capsule_id.clone(),
            archive_path,
            merkle_root: report.manifest.merkle_root,
            files: report.files,
            merkle_root_matches: report.merkle_root_matches,
            digests_match: report.digests_match,
            ledger_recorded: recorded.is_some(),
            ledger_root_matches,
            valid,
        })
    }

    /// Read-only chain check over an inclusive sequence range.
    pub fn validate_ledger(&self, range: RangeInclusive<u64>) -> Result<ValidationResult> {
        self.ledger.validate_chain(*range.start(), *range.end())
    }

    /// Join a remote snapshot into local and persisted state.
    ///
    /// The `blackboard_merged` ledger entry is an audit record written after the
    /// merge is persisted. If that append fails the merge still stands; the
    /// failure is logged and the merged snapshot is returned.
    pub fn merge_blackboard(&self, remote: &BlackboardSnapshot) -> Result<BlackboardSnapshot> {
        let merged = {
            let mut bb = self.blackboard.lock().unwrap_or_else(|p| p.into_inner());
            bb.merge(remote);
            self.persist(&mut bb)?;
            bb.snapshot()
        };
        let recorded = self.ledger.append(
            EventType::BlackboardMerged,
            json!({
                "replica": self.config.writer_id,
                "remote_keys": remote.len(),
                "keys": merged.len(),
            }),
        );
        if let Err(e) = recorded {
            utils::log_error(&format!("vault: merge persisted but not recorded in ledger: {}", e));
        }
        Ok(merged)
    }

    /// Local state joined with whatever is persisted now.
    pub fn blackboard_snapshot(&self) -> BlackboardSnapshot {
        let mut bb = self.blackboard.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = self.refresh(&mut bb) {
            utils::log_error(&format!("vault: could not reload blackboard: {}", e));
        }
        bb.snapshot()
    }

    /// Clear a capsule's reinjection flag. Returns how many live tags were removed.
    pub fn clear_reinjection(&self, capsule_id: &str) -> Result<usize> {
        let mut bb = self.blackboard.lock().unwrap_or_else(|p| p.into_inner());
        self.refresh(&mut bb)?;
        let removed = bb.remove_presence(&blackboard::reinject_key(capsule_id), PENDING);
        if removed > 0 {
            self.persist(&mut bb)?;
            utils::log(&format!("vault: cleared reinjection flag for {}", capsule_id));
        }
        Ok(removed)
    }
}

/// Resolved absolute form when the file exists, the path as given otherwise.
fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
