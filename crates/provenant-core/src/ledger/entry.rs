//! Ledger entry model and its canonical, hashable form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{invalid_input, serde_error, ProvenanceError, Result};
use crate::hasher::{digest_parts, Digest};

/// Fixed set of provenance event tags. Stored snake_case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CapsuleCreated,
    ArchiveSealed,
    ValidationRun,
    CapsuleFailed,
    CapsuleVerified,
    BlackboardMerged,
    CustomEvent,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::CapsuleCreated,
        EventType::ArchiveSealed,
        EventType::ValidationRun,
        EventType::CapsuleFailed,
        EventType::CapsuleVerified,
        EventType::BlackboardMerged,
        EventType::CustomEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CapsuleCreated => "capsule_created",
            EventType::ArchiveSealed => "archive_sealed",
            EventType::ValidationRun => "validation_run",
            EventType::CapsuleFailed => "capsule_failed",
            EventType::CapsuleVerified => "capsule_verified",
            EventType::BlackboardMerged => "blackboard_merged",
            EventType::CustomEvent => "custom_event",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ProvenanceError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = EventType::ALL.iter().map(|e| e.as_str()).collect();
                invalid_input(
                    "parse_event_type",
                    format!("unknown event type {:?} (expected one of: {})", s, known.join(", ")),
                )
            })
    }
}

/// One committed ledger record. Field order here is the on-disk order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub timestamp: String,
    pub event_type: EventType,
    pub payload: Value,
    pub prev_hash: Digest,
    pub entry_hash: Digest,
}

/// Everything except `entry_hash`, in hashing order.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    sequence: u64,
    timestamp: &'a str,
    event_type: EventType,
    payload: &'a Value,
    prev_hash: &'a Digest,
}

/// Rebuild `value` with every object's keys in sorted order, independent of
/// how serde_json's map happens to be configured.
pub fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), sorted_value(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        other => other.clone(),
    }
}

impl LedgerEntry {
    /// Build an entry and compute its hash.
    pub(crate) fn seal(
        sequence: u64,
        timestamp: String,
        event_type: EventType,
        payload: Value,
        prev_hash: Digest,
    ) -> Result<Self> {
        let mut entry = LedgerEntry {
            sequence,
            timestamp,
            event_type,
            payload: sorted_value(&payload),
            prev_hash,
            entry_hash: Digest::ZERO,
        };
        entry.entry_hash = entry.compute_hash()?;
        Ok(entry)
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let payload = sorted_value(&self.payload);
        let canonical = CanonicalEntry {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            event_type: self.event_type,
            payload: &payload,
            prev_hash: &self.prev_hash,
        };
        serde_json::to_vec(&canonical).map_err(|e| serde_error("ledger_canonical", e))
    }

    /// `H(canonical(entry minus entry_hash) || prev_hash)`
    pub fn compute_hash(&self) -> Result<Digest> {
        let canonical = self.canonical_bytes()?;
        Ok(digest_parts(&[&canonical, self.prev_hash.to_hex().as_bytes()]))
    }

    pub fn is_self_consistent(&self) -> bool {
        matches!(self.compute_hash(), Ok(h) if h == self.entry_hash)
    }

    /// One JSONL line, including the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).map_err(|e| serde_error("ledger_encode", e))?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| serde_error("ledger_decode", e))
    }
}
