//! Replicated blackboard: LWW registers plus OR-Set presence tags per key.

mod crdt;
mod engine;
mod store;

pub use crdt::{
    BlackboardEntry, BlackboardSnapshot, Bottom, JoinSemilattice, LwwRegister, OrSet, Tag, WriterStamp,
};
pub use engine::Blackboard;
pub use store::{JsonFileStore, MemoryStore, SnapshotStore};

/// Presence key marking a capsule for reinjection
pub fn reinject_key(capsule_id: &str) -> String {
    format!("reinject:{}", capsule_id)
}

/// LWW key holding a capsule's latest archive location
pub fn capsule_key(capsule_id: &str) -> String {
    format!("capsule:{}", capsule_id)
}

pub const PENDING: &str = "pending";
