//! State-based CRDTs backing the blackboard.
//!
//! Every type here is a join-semilattice: `join` is commutative, associative
//! and idempotent, and `bottom()` is its identity.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::sorted_value;

pub trait JoinSemilattice {
    fn join(&self, other: &Self) -> Self;
}

pub trait Bottom {
    fn bottom() -> Self;
}

/// Writer timestamp: logical time first, writer id breaks ties.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriterStamp {
    pub logical_time: u64,
    pub writer: String,
}

impl WriterStamp {
    pub fn new(logical_time: u64, writer: impl Into<String>) -> Self {
        Self { logical_time, writer: writer.into() }
    }
}

fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&sorted_value(value)).unwrap_or_default()
}

/// Last-write-wins register
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister {
    pub value: Value,
    pub stamp: WriterStamp,
}

impl LwwRegister {
    pub fn new(value: Value, stamp: WriterStamp) -> Self {
        Self { value, stamp }
    }

    /// True when `self` wins against `other`.
    fn dominates(&self, other: &Self) -> bool {
        match self.stamp.cmp(&other.stamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            // same writer and time with different values: larger canonical encoding wins
            std::cmp::Ordering::Equal => canonical_bytes(&self.value) >= canonical_bytes(&other.value),
        }
    }
}

impl JoinSemilattice for LwwRegister {
    fn join(&self, other: &Self) -> Self {
        if self.dominates(other) {
            self.clone()
        } else {
            other.clone()
        }
    }
}

/// One add-token of an OR-Set element
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub element: String,
    pub id: String,
}

/// Observed-remove set. An element is present iff it has an add-tag that is not tombstoned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrSet {
    pub added: BTreeSet<Tag>,
    pub removed: BTreeSet<Tag>,
}

impl OrSet {
    pub fn add(&mut self, element: impl Into<String>, id: impl Into<String>) -> Tag {
        let tag = Tag { element: element.into(), id: id.into() };
        self.added.insert(tag.clone());
        tag
    }

    /// Tombstone every add-tag of `element` observed so far. Returns how many were live.
    pub fn remove(&mut self, element: &str) -> usize {
        let live: Vec<Tag> = self.live_tags(element).cloned().collect();
        let count = live.len();
        self.removed.extend(live);
        count
    }

    fn live_tags<'a>(&'a self, element: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.added
            .iter()
            .filter(move |t| t.element == element && !self.removed.contains(*t))
    }

    pub fn contains(&self, element: &str) -> bool {
        self.live_tags(element).next().is_some()
    }

    pub fn elements(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .filter(|t| !self.removed.contains(*t))
            .map(|t| t.element.clone())
            .collect()
    }
}

impl JoinSemilattice for OrSet {
    fn join(&self, other: &Self) -> Self {
        OrSet {
            added: self.added.union(&other.added).cloned().collect(),
            removed: self.removed.union(&other.removed).cloned().collect(),
        }
    }
}

impl Bottom for OrSet {
    fn bottom() -> Self {
        OrSet::default()
    }
}

/// State held under one blackboard key: an optional LWW value and a presence set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackboardEntry {
    #[serde(default)]
    pub register: Option<LwwRegister>,
    #[serde(default)]
    pub presence: OrSet,
}

impl BlackboardEntry {
    pub fn value(&self) -> Option<&Value> {
        self.register.as_ref().map(|r| &r.value)
    }

    pub fn writer_timestamp(&self) -> Option<&WriterStamp> {
        self.register.as_ref().map(|r| &r.stamp)
    }

    fn max_logical_time(&self) -> u64 {
        self.writer_timestamp().map(|s| s.logical_time).unwrap_or(0)
    }
}

impl JoinSemilattice for BlackboardEntry {
    fn join(&self, other: &Self) -> Self {
        let register = match (&self.register, &other.register) {
            (Some(a), Some(b)) => Some(a.join(b)),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        BlackboardEntry { register, presence: self.presence.join(&other.presence) }
    }
}

impl Bottom for BlackboardEntry {
    fn bottom() -> Self {
        BlackboardEntry::default()
    }
}

/// Full replicated state, keyed by logical name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackboardSnapshot {
    #[serde(default)]
    pub entries: BTreeMap<String, BlackboardEntry>,
}

impl BlackboardSnapshot {
    pub fn get(&self, key: &str) -> Option<&BlackboardEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_present(&self, key: &str, element: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.presence.contains(element))
            .unwrap_or(false)
    }

    /// Highest logical time of any register in the snapshot
    pub fn max_logical_time(&self) -> u64 {
        self.entries.values().map(BlackboardEntry::max_logical_time).max().unwrap_or(0)
    }
}

impl JoinSemilattice for BlackboardSnapshot {
    fn join(&self, other: &Self) -> Self {
        let mut entries = self.entries.clone();
        for (key, theirs) in &other.entries {
            let merged = match entries.get(key) {
                Some(ours) => ours.join(theirs),
                None => theirs.clone(),
            };
            entries.insert(key.clone(), merged);
        }
        BlackboardSnapshot { entries }
    }
}

impl Bottom for BlackboardSnapshot {
    fn bottom() -> Self {
        BlackboardSnapshot::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn reg(value: Value, t: u64, w: &str) -> LwwRegister {
        LwwRegister::new(value, WriterStamp::new(t, w))
    }

    #[test]
    fn test_lww_higher_time_wins() {
        let a = reg(json!("old"), 1, "z");
        let b = reg(json!("new"), 2, "a");
        assert_eq!(a.join(&b).value, json!("new"));
        assert_eq!(b.join(&a).value, json!("new"));
    }

    #[test]
    fn test_lww_tie_larger_writer_wins() {
        let a = reg(json!(1), 5, "alpha");
        let b = reg(json!(2), 5, "beta");
        assert_eq!(a.join(&b).stamp.writer, "beta");
        assert_eq!(b.join(&a).stamp.writer, "beta");
    }

    #[test]
    fn test_lww_full_tie_is_commutative() {
        let a = reg(json!({"x": 1}), 5, "w");
        let b = reg(json!({"x": 2}), 5, "w");
        assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn test_or_set_add_remove() {
        let mut s = OrSet::default();
        s.add("pending", "r1:1:aa");
        assert!(s.contains("pending"));
        assert_eq!(s.remove("pending"), 1);
        assert!(!s.contains("pending"));
        assert_eq!(s.remove("pending"), 0);
    }

    #[test]
    fn test_or_set_concurrent_add_survives_remove() {
        let mut base = OrSet::default();
        base.add("pending", "r1:1:aa");

        let mut remover = base.clone();
        remover.remove("pending");

        let mut adder = base.clone();
        adder.add("pending", "r2:1:bb");

        // the remove never observed r2's tag
        assert!(remover.join(&adder).contains("pending"));
        assert!(adder.join(&remover).contains("pending"));
    }

    #[test]
    fn test_snapshot_serde_shape() {
        let mut snap = BlackboardSnapshot::default();
        let mut entry = BlackboardEntry::default();
        entry.register = Some(reg(json!({"v": 1}), 3, "r1"));
        entry.presence.add("pending", "r1:1:aa");
        snap.entries.insert("capsule:CAP-1".into(), entry);

        let text = serde_json::to_string(&snap).unwrap();
        let back: BlackboardSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back, snap);
        let empty: BlackboardSnapshot = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    fn arb_stamp() -> impl Strategy<Value = WriterStamp> {
        (0u64..4, prop_oneof!["a", "b", "c"]).prop_map(|(t, w)| WriterStamp::new(t, w))
    }

    fn arb_register() -> impl Strategy<Value = LwwRegister> {
        (0i64..3, arb_stamp()).prop_map(|(v, stamp)| LwwRegister::new(json!(v), stamp))
    }

    fn arb_or_set() -> impl Strategy<Value = OrSet> {
        let tag = (prop_oneof!["pending", "done"], 0u8..6)
            .prop_map(|(e, id)| Tag { element: e.to_string(), id: format!("t{}", id) });
        (
            proptest::collection::btree_set(tag.clone(), 0..5),
            proptest::collection::btree_set(tag, 0..3),
        )
            .prop_map(|(added, removed)| OrSet { added, removed })
    }

    fn arb_snapshot() -> impl Strategy<Value = BlackboardSnapshot> {
        let entry = (proptest::option::of(arb_register()), arb_or_set())
            .prop_map(|(register, presence)| BlackboardEntry { register, presence });
        proptest::collection::btree_map(prop_oneof!["k1", "k2", "k3"], entry, 0..3)
            .prop_map(|entries| BlackboardSnapshot { entries })
    }

    proptest! {
        #[test]
        fn prop_snapshot_join_commutative(a in arb_snapshot(), b in arb_snapshot()) {
            prop_assert_eq!(a.join(&b), b.join(&a));
        }

        #[test]
        fn prop_snapshot_join_associative(a in arb_snapshot(), b in arb_snapshot(), c in arb_snapshot()) {
            prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        }

        #[test]
        fn prop_snapshot_join_idempotent(a in arb_snapshot(), b in arb_snapshot()) {
            let ab = a.join(&b);
            prop_assert_eq!(ab.join(&b), ab.clone());
            prop_assert_eq!(a.join(&a), a);
        }

        #[test]
        fn prop_snapshot_bottom_identity(a in arb_snapshot()) {
            prop_assert_eq!(a.join(&BlackboardSnapshot::bottom()), a);
        }

        #[test]
        fn prop_register_join_commutative(a in arb_register(), b in arb_register()) {
            prop_assert_eq!(a.join(&b), b.join(&a));
        }
    }
}
