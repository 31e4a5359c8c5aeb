//! Provenance ledger: hash-chained, append-only event log.

mod chain;
mod entry;

pub use chain::{ChainMismatch, Ledger, MismatchKind, ValidationResult};
pub use entry::{sorted_value, EventType, LedgerEntry};
