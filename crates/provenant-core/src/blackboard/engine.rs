use serde_json::Value;

use crate::blackboard::crdt::{BlackboardSnapshot, JoinSemilattice, LwwRegister, Tag, WriterStamp};
use crate::utils;

/// One replica's view of the blackboard.
///
/// Local writes are stamped with a Lamport clock that is pushed past every
/// remote timestamp seen in `merge`, so a later local write always beats
/// anything this replica has already observed.
#[derive(Clone, Debug)]
pub struct Blackboard {
    replica_id: String,
    clock: u64,
    tag_counter: u64,
    state: BlackboardSnapshot,
}

impl Blackboard {
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self::from_snapshot(replica_id, BlackboardSnapshot::default())
    }

    pub fn from_snapshot(replica_id: impl Into<String>, state: BlackboardSnapshot) -> Self {
        let replica_id = replica_id.into();
        let prefix = format!("{}:", replica_id);
        // resume the tag counter so reloaded replicas never reuse an id prefix
        let tag_counter = state
            .entries
            .values()
            .flat_map(|e| e.presence.added.iter())
            .filter_map(|t| t.id.strip_prefix(&prefix))
            .filter_map(|rest| rest.split(':').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Self {
            clock: state.max_logical_time(),
            tag_counter,
            replica_id,
            state,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Record a local write at an explicit logical time.
    /// Returns false when an already-known write dominates it.
    pub fn apply_local(&mut self, key: &str, value: Value, timestamp: u64) -> bool {
        self.clock = self.clock.max(timestamp);
        let candidate = LwwRegister::new(value, WriterStamp::new(timestamp, self.replica_id.clone()));
        let entry = self.state.entries.entry(key.to_string()).or_default();
        let merged = match &entry.register {
            Some(current) => current.join(&candidate),
            None => candidate.clone(),
        };
        let won = merged == candidate;
        entry.register = Some(merged);
        won
    }

    /// Write at the next tick of the local clock.
    pub fn set(&mut self, key: &str, value: Value) -> WriterStamp {
        let t = self.clock + 1;
        self.apply_local(key, value, t);
        WriterStamp::new(t, self.replica_id.clone())
    }

    pub fn add_presence(&mut self, key: &str, element: &str) -> Tag {
        self.tag_counter += 1;
        let id = format!("{}:{}:{}", self.replica_id, self.tag_counter, utils::random_hex(4));
        self.state
            .entries
            .entry(key.to_string())
            .or_default()
            .presence
            .add(element, id)
    }

    /// Tombstone the observed add-tags of `element`; returns how many were live.
    pub fn remove_presence(&mut self, key: &str, element: &str) -> usize {
        match self.state.entries.get_mut(key) {
            Some(entry) => entry.presence.remove(element),
            None => 0,
        }
    }

    pub fn is_present(&self, key: &str, element: &str) -> bool {
        self.state.is_present(key, element)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.state.get(key).and_then(|e| e.value())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.state.entries.keys()
    }

    /// Join a remote snapshot into local state and return the result.
    pub fn merge(&mut self, remote: &BlackboardSnapshot) -> BlackboardSnapshot {
        self.absorb(remote);
        utils::log(&format!(
            "blackboard: merged {} remote keys into replica {} ({} keys)",
            remote.len(),
            self.replica_id,
            self.state.len()
        ));
        self.state.clone()
    }

    /// Quiet join, used to fold persisted state back in after a save.
    pub fn absorb(&mut self, other: &BlackboardSnapshot) {
        self.state = self.state.join(other);
        self.clock = self.clock.max(other.max_logical_time());
    }

    pub fn snapshot(&self) -> BlackboardSnapshot {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "reinject:CAP-1";

    #[test]
    fn test_local_writes_advance_clock() {
        let mut bb = Blackboard::new("r1");
        let s1 = bb.set("k", json!(1));
        let s2 = bb.set("k", json!(2));
        assert!(s2 > s1);
        assert_eq!(bb.value("k"), Some(&json!(2)));
    }

    #[test]
    fn test_stale_local_write_loses() {
        let mut bb = Blackboard::new("r1");
        assert!(bb.apply_local("k", json!("new"), 10));
        assert!(!bb.apply_local("k", json!("old"), 3));
        assert_eq!(bb.value("k"), Some(&json!("new")));
    }

    #[test]
    fn test_merge_pushes_clock_past_remote() {
        let mut remote = Blackboard::new("r2");
        remote.apply_local("k", json!("remote"), 40);
        let mut local = Blackboard::new("r1");
        local.merge(&remote.snapshot());
        assert_eq!(local.clock(), 40);
        local.set("k", json!("local"));
        assert_eq!(local.value("k"), Some(&json!("local")));
    }

    #[test]
    fn test_add_remove_converges_in_either_order() {
        let mut origin = Blackboard::new("r1");
        origin.add_presence(KEY, "pending");
        let added = origin.snapshot();

        let mut remover = Blackboard::new("r2");
        remover.merge(&added);
        assert_eq!(remover.remove_presence(KEY, "pending"), 1);
        let removed = remover.snapshot();

        let mut x = Blackboard::new("x");
        x.merge(&added);
        x.merge(&removed);

        let mut y = Blackboard::new("y");
        y.merge(&removed);
        y.merge(&added);
        y.merge(&removed);

        assert_eq!(x.is_present(KEY, "pending"), y.is_present(KEY, "pending"));
        assert!(!x.is_present(KEY, "pending"));
        assert_eq!(x.snapshot(), y.snapshot());
    }

    #[test]
    fn test_reloaded_replica_never_reuses_tag_ids() {
        let mut bb = Blackboard::new("r1");
        let first = bb.add_presence(KEY, "pending");
        let mut reloaded = Blackboard::from_snapshot("r1", bb.snapshot());
        let second = reloaded.add_presence(KEY, "pending");
        assert!(first.id.starts_with("r1:1:"));
        assert!(second.id.starts_with("r1:2:"));
    }
}
