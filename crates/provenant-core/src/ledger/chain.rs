//! Append-only, hash-chained JSONL ledger.
//!
//! The tail cursor (next sequence, last hash, committed byte length) is the only
//! mutable shared state. Appends hold an in-process mutex and a cross-process
//! lock file for the read-last / compute / write critical section.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{invalid_input, io_error, ProvenanceError, Result};
use crate::hasher::Digest;
use crate::ledger::entry::{EventType, LedgerEntry};
use crate::lock::FileLock;
use crate::utils;

/// Why a range failed validation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Recomputed entry hash differs from the stored one
    EntryHash,
    /// Stored prev_hash does not equal the previous entry's stored hash
    PrevHashLink,
    /// Sequence number is not the line's position
    Sequence,
    /// A committed line could not be decoded
    Malformed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMismatch {
    pub index: u64,
    pub kind: MismatchKind,
    pub expected: String,
    pub actual: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    /// Sequences that validated before the first mismatch (all of them when valid)
    pub checked: Vec<u64>,
    pub first_mismatch: Option<ChainMismatch>,
}

#[derive(Debug)]
enum ScannedLine {
    Entry(LedgerEntry),
    Malformed(String),
}

/// Committed view of the ledger file.
#[derive(Debug, Default)]
struct Scan {
    lines: Vec<ScannedLine>,
    /// Byte length up to and including the last newline
    committed_len: u64,
    /// Bytes after the last newline (an interrupted append)
    uncommitted_len: u64,
}

impl Scan {
    fn last_entry(&self) -> Option<&LedgerEntry> {
        self.lines.iter().rev().find_map(|l| match l {
            ScannedLine::Entry(e) => Some(e),
            ScannedLine::Malformed(_) => None,
        })
    }

    fn into_entries(self) -> Result<Vec<LedgerEntry>> {
        self.lines
            .into_iter()
            .enumerate()
            .map(|(i, l)| match l {
                ScannedLine::Entry(e) => Ok(e),
                ScannedLine::Malformed(reason) => Err(ProvenanceError::IntegrityViolation {
                    operation: "ledger_read".to_string(),
                    subject: format!("ledger line {}", i),
                    expected: "decodable ledger entry".to_string(),
                    actual: reason,
                }),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Tail {
    next_sequence: u64,
    last_hash: Digest,
    committed_len: u64,
}

impl Tail {
    fn from_scan(scan: &Scan) -> Self {
        let (next_sequence, last_hash) = match scan.last_entry() {
            Some(e) => (e.sequence + 1, e.entry_hash),
            None => (0, Digest::ZERO),
        };
        Self { next_sequence, last_hash, committed_len: scan.committed_len }
    }
}

fn scan_file(path: &Path) -> Result<Scan> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Scan::default()),
        Err(e) => return Err(io_error("ledger_scan", Some(path), e)),
    };
    let committed_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);
    let mut lines = Vec::new();
    for raw in bytes[..committed_len].split(|b| *b == b'\n') {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let parsed = std::str::from_utf8(raw)
            .map_err(|e| e.to_string())
            .and_then(|s| LedgerEntry::from_line(s).map_err(|e| e.to_string()));
        lines.push(match parsed {
            Ok(entry) => ScannedLine::Entry(entry),
            Err(reason) => ScannedLine::Malformed(reason),
        });
    }
    Ok(Scan {
        lines,
        committed_len: committed_len as u64,
        uncommitted_len: (bytes.len() - committed_len) as u64,
    })
}

pub struct Ledger {
    path: PathBuf,
    lock: FileLock,
    lock_timeout: Duration,
    tail: Mutex<Tail>,
}

impl Ledger {
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("ledger_open", Some(parent), e))?;
        }
        let scan = scan_file(&path)?;
        if scan.uncommitted_len > 0 {
            utils::log(&format!(
                "ledger: {} trailing uncommitted bytes in {} will be discarded on next append",
                scan.uncommitted_len,
                path.display()
            ));
        }
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        Ok(Self {
            tail: Mutex::new(Tail::from_scan(&scan)),
            lock: FileLock::new(lock_path),
            lock_timeout,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Sequence, timestamp and hash are assigned here.
    pub fn append(&self, event_type: EventType, payload: Value) -> Result<LedgerEntry> {
        let mut tail = self.tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _guard = self.lock.acquire(self.lock_timeout)?;

        let on_disk = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(io_error("ledger_append", Some(&self.path), e)),
        };
        if on_disk != tail.committed_len {
            // another writer appended, or a torn record is sitting at the tail
            let scan = scan_file(&self.path)?;
            if scan.uncommitted_len > 0 {
                self.truncate_to(scan.committed_len)?;
                utils::log(&format!(
                    "ledger: discarded {} uncommitted bytes at offset {}",
                    scan.uncommitted_len, scan.committed_len
                ));
            }
            *tail = Tail::from_scan(&scan);
        }

        let entry = LedgerEntry::seal(
            tail.next_sequence,
            utils::now_rfc3339(),
            event_type,
            payload,
            tail.last_hash,
        )?;
        let line = entry.to_line()?;

        let written = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            file.write_all(line.as_bytes())?;
            file.sync_data()
        })();
        if let Err(e) = written {
            let _ = self.truncate_to(tail.committed_len);
            return Err(io_error("ledger_append", Some(&self.path), e));
        }

        tail.next_sequence = entry.sequence + 1;
        tail.last_hash = entry.entry_hash;
        tail.committed_len += line.len() as u64;
        utils::log(&format!(
            "ledger: appended #{} {} {}",
            entry.sequence, entry.event_type, entry.entry_hash
        ));
        Ok(entry)
    }

    fn truncate_to(&self, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| io_error("ledger_truncate", Some(&self.path), e))?;
        file.set_len(len)
            .and_then(|_| file.sync_data())
            .map_err(|e| io_error("ledger_truncate", Some(&self.path), e))
    }

    /// All committed entries. A malformed committed line is an integrity error.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        scan_file(&self.path)?.into_entries()
    }

    pub fn get(&self, sequence: u64) -> Result<LedgerEntry> {
        self.entries()?
            .into_iter()
            .find(|e| e.sequence == sequence)
            .ok_or_else(|| crate::error::not_found("ledger_get", format!("sequence {}", sequence)))
    }

    /// Number of committed lines
    pub fn len(&self) -> Result<u64> {
        Ok(scan_file(&self.path)?.lines.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn last(&self) -> Result<Option<LedgerEntry>> {
        Ok(self.entries()?.pop())
    }

    /// Most recent entry of `event_type` whose payload satisfies `predicate`.
    pub fn find_latest<F>(&self, event_type: EventType, predicate: F) -> Result<Option<LedgerEntry>>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|e| e.event_type == event_type && predicate(&e.payload)))
    }

    /// Recompute hashes for sequences `from..=to` and report the first mismatch.
    /// `to` is clamped to the last committed entry.
    pub fn validate_chain(&self, from: u64, to: u64) -> Result<ValidationResult> {
        if from > to {
            return Err(invalid_input(
                "validate_chain",
                format!("range start {} is after end {}", from, to),
            ));
        }
        let scan = scan_file(&self.path)?;
        let total = scan.lines.len() as u64;
        let mut result = ValidationResult { valid: true, checked: Vec::new(), first_mismatch: None };
        if total == 0 || from >= total {
            return Ok(result);
        }
        let to = to.min(total - 1);

        let mut expected_prev = if from == 0 {
            Some(Digest::ZERO)
        } else {
            match &scan.lines[(from - 1) as usize] {
                ScannedLine::Entry(prev) => Some(prev.entry_hash),
                ScannedLine::Malformed(_) => None,
            }
        };

        for index in from..=to {
            let mismatch = match &scan.lines[index as usize] {
                ScannedLine::Malformed(reason) => Some(ChainMismatch {
                    index,
                    kind: MismatchKind::Malformed,
                    expected: "decodable ledger entry".to_string(),
                    actual: reason.clone(),
                }),
                ScannedLine::Entry(entry) => check_entry(index, entry, expected_prev.as_ref())?,
            };
            if let Some(mismatch) = mismatch {
                utils::log_error(&format!(
                    "ledger: chain mismatch at #{} ({:?})",
                    mismatch.index, mismatch.kind
                ));
                result.valid = false;
                result.first_mismatch = Some(mismatch);
                return Ok(result);
            }
            if let ScannedLine::Entry(entry) = &scan.lines[index as usize] {
                expected_prev = Some(entry.entry_hash);
            }
            result.checked.push(index);
        }
        Ok(result)
    }

    pub fn validate_all(&self) -> Result<ValidationResult> {
        self.validate_chain(0, u64::MAX)
    }
}

fn check_entry(index: u64, entry: &LedgerEntry, expected_prev: Option<&Digest>) -> Result<Option<ChainMismatch>> {
    if entry.sequence != index {
        return Ok(Some(ChainMismatch {
            index,
            kind: MismatchKind::Sequence,
            expected: index.to_string(),
            actual: entry.sequence.to_string(),
        }));
    }
    let recomputed = entry.compute_hash()?;
    if recomputed != entry.entry_hash {
        return Ok(Some(ChainMismatch {
            index,
            kind: MismatchKind::EntryHash,
            expected: recomputed.to_hex(),
            actual: entry.entry_hash.to_hex(),
        }));
    }
    if let Some(prev) = expected_prev {
        if entry.prev_hash != *prev {
            return Ok(Some(ChainMismatch {
                index,
                kind: MismatchKind::PrevHashLink,
                expected: prev.to_hex(),
                actual: entry.prev_hash.to_hex(),
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ledger(dir: &Path) -> Ledger {
        Ledger::open(dir.join("ledger.jsonl"), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_three_event_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.append(EventType::CapsuleCreated, json!({"capsule_id": "CAP-1"})).unwrap();
        l.append(EventType::ArchiveSealed, json!({"capsule_id": "CAP-1"})).unwrap();
        l.append(EventType::ValidationRun, json!({})).unwrap();

        let result = l.validate_chain(0, 2).unwrap();
        assert!(result.valid);
        assert_eq!(result.checked, vec![0, 1, 2]);
        assert!(result.first_mismatch.is_none());
    }

    #[test]
    fn test_chain_links_and_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        let a = l.append(EventType::CustomEvent, json!({"n": 1})).unwrap();
        let b = l.append(EventType::CustomEvent, json!({"n": 2})).unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(a.prev_hash, Digest::ZERO);
        assert_eq!(b.sequence, 1);
        assert_eq!(b.prev_hash, a.entry_hash);
        assert_eq!(l.entries().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_valid_after_every_append() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        for i in 0..20 {
            l.append(EventType::CustomEvent, json!({"i": i})).unwrap();
            let r = l.validate_all().unwrap();
            assert!(r.valid, "invalid after append {}", i);
            assert_eq!(r.checked.len(), i + 1);
        }
    }

    #[test]
    fn test_flipped_entry_hash_reports_that_index() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        let mut target = None;
        for i in 0..5 {
            let e = l.append(EventType::CustomEvent, json!({"i": i})).unwrap();
            if i == 2 {
                target = Some(e.entry_hash.to_hex());
            }
        }
        let target = target.unwrap();
        let first = target.chars().next().unwrap();
        let flipped_char = if first == 'a' { 'b' } else { 'a' };
        let flipped = format!("{}{}", flipped_char, &target[1..]);
        let content = fs::read_to_string(l.path()).unwrap();
        let needle = format!("\"entry_hash\":\"{}\"", target);
        let replacement = format!("\"entry_hash\":\"{}\"", flipped);
        assert!(content.contains(&needle));
        fs::write(l.path(), content.replacen(&needle, &replacement, 1)).unwrap();

        let r = l.validate_all().unwrap();
        assert!(!r.valid);
        let m = r.first_mismatch.unwrap();
        assert_eq!(m.index, 2);
        assert_eq!(m.kind, MismatchKind::EntryHash);
        assert_eq!(m.expected, target);
        assert_eq!(m.actual, flipped);
        assert_eq!(r.checked, vec![0, 1]);
    }

    #[test]
    fn test_edited_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.append(EventType::CustomEvent, json!({"amount": 10})).unwrap();
        l.append(EventType::CustomEvent, json!({"amount": 20})).unwrap();
        let content = fs::read_to_string(l.path()).unwrap();
        fs::write(l.path(), content.replace("\"amount\":20", "\"amount\":99")).unwrap();
        let m = l.validate_all().unwrap().first_mismatch.unwrap();
        assert_eq!(m.index, 1);
        assert_eq!(m.kind, MismatchKind::EntryHash);
    }

    #[test]
    fn test_subrange_checks_link_to_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        for i in 0..4 {
            l.append(EventType::CustomEvent, json!({"i": i})).unwrap();
        }
        let r = l.validate_chain(1, 2).unwrap();
        assert!(r.valid);
        assert_eq!(r.checked, vec![1, 2]);
        assert_eq!(l.validate_chain(2, 100).unwrap().checked, vec![2, 3]);
        assert!(l.validate_chain(3, 1).is_err());
        assert!(l.validate_chain(10, 12).unwrap().checked.is_empty());
    }

    #[test]
    fn test_torn_tail_is_excluded_then_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.append(EventType::CustomEvent, json!({"i": 0})).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(l.path()).unwrap();
            f.write_all(b"{\"sequence\":1,\"timestamp\":\"20").unwrap();
        }
        assert_eq!(l.entries().unwrap().len(), 1);
        assert!(l.validate_all().unwrap().valid);

        let reopened = ledger(dir.path());
        let e = reopened.append(EventType::CustomEvent, json!({"i": 1})).unwrap();
        assert_eq!(e.sequence, 1);
        let r = reopened.validate_all().unwrap();
        assert!(r.valid);
        assert_eq!(r.checked, vec![0, 1]);
    }

    #[test]
    fn test_malformed_committed_line_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.append(EventType::CustomEvent, json!({"i": 0})).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(l.path()).unwrap();
            f.write_all(b"not json at all\n").unwrap();
        }
        let r = l.validate_all().unwrap();
        assert_eq!(r.first_mismatch.unwrap().kind, MismatchKind::Malformed);
        assert!(l.entries().unwrap_err().is_integrity());
    }

    #[test]
    fn test_concurrent_appends_do_not_fork() {
        let dir = tempfile::tempdir().unwrap();
        let l = Arc::new(ledger(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let l = Arc::clone(&l);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        l.append(EventType::CustomEvent, json!({"thread": t, "i": i})).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let entries = l.entries().unwrap();
        assert_eq!(entries.len(), 200);
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (0..200).collect::<Vec<_>>());
        assert!(l.validate_all().unwrap().valid);
    }

    #[test]
    fn test_two_handles_on_one_file_stay_linear() {
        // separate handles share only the file and its lock, like two processes
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(ledger(dir.path()));
        let b = Arc::new(ledger(dir.path()));
        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|l| {
                std::thread::spawn(move || {
                    for i in 0..30 {
                        l.append(EventType::CustomEvent, json!({"i": i})).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let check = ledger(dir.path());
        let r = check.validate_all().unwrap();
        assert!(r.valid);
        assert_eq!(r.checked.len(), 60);
    }

    #[test]
    fn test_find_latest() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.append(EventType::CapsuleCreated, json!({"capsule_id": "A", "v": 1})).unwrap();
        l.append(EventType::CapsuleCreated, json!({"capsule_id": "B"})).unwrap();
        l.append(EventType::CapsuleCreated, json!({"capsule_id": "A", "v": 2})).unwrap();
        let found = l
            .find_latest(EventType::CapsuleCreated, |p| p["capsule_id"] == "A")
            .unwrap()
            .unwrap();
        assert_eq!(found.payload["v"], 2);
        assert!(l.find_latest(EventType::CapsuleFailed, |_| true).unwrap().is_none());
        assert_eq!(l.get(1).unwrap().payload["capsule_id"], "B");
        assert!(matches!(l.get(9).unwrap_err(), ProvenanceError::NotFound { .. }));
    }
}
