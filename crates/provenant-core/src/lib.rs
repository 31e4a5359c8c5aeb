//! Core library for provenant: hash-chained ledger, content-addressed store,
//! Merkle trees, capsule archives and the blackboard CRDT.
//! Used by the CLI binary; can be embedded by any collaborator that records provenance.

pub mod archive;
pub mod blackboard;
pub mod cas;
pub mod config;
pub mod error;
pub mod hasher;
pub mod ledger;
pub mod lock;
pub mod utils;
pub mod vault;

// Re-export main API for CLI
pub use archive::{Archive, ArchiveReport, Archiver, Capsule, FileCheck, Manifest};
pub use blackboard::{Blackboard, BlackboardSnapshot, JoinSemilattice};
pub use cas::{ContentAddressableStore, MerkleTree};
pub use config::{load_config, Config};
pub use error::{ProvenanceError, Result};
pub use hasher::Digest;
pub use ledger::{EventType, Ledger, LedgerEntry, ValidationResult};
pub use utils::{init_logging, log, log_error};
pub use vault::{CapsuleRef, StoreReceipt, Vault, VerificationReport};
