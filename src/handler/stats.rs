//! Stats adaptors (spec §2 "Stats adaptors", §9): a thin update interface
//! to counts-by-tag and the total-timer gauge. Grounded in the teacher's
//! thin-trait-plus-test-double pattern for external subsystems
//! (`ConfigProvider`, `CrossCrateEventHandler`): production wires this to
//! an SNMP MIB, tests wire it to [`InMemoryStatsSink`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

/// `increment`/`decrement`/`set` only (spec §9) — real implementations
/// store to an SNMP MIB, so there's deliberately no way to read a count
/// back out of this trait itself.
pub trait StatsSink: Send + Sync {
    fn increment(&self, tag: &str, by: u32);
    fn decrement(&self, tag: &str, by: u32);
    fn set(&self, count: i64);
}

/// Discards every update. Used where a deployment has no stats backend
/// wired up yet.
#[derive(Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn increment(&self, _tag: &str, _by: u32) {}
    fn decrement(&self, _tag: &str, _by: u32) {}
    fn set(&self, _count: i64) {}
}

/// In-memory test double: records per-tag counts and the last value
/// `set` was called with, so tests can assert on them directly.
#[derive(Default)]
pub struct InMemoryStatsSink {
    tags: Mutex<BTreeMap<String, i64>>,
    total: AtomicI64,
}

impl InMemoryStatsSink {
    pub fn snapshot_tags(&self) -> BTreeMap<String, i64> {
        self.tags.lock().clone()
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }
}

impl StatsSink for InMemoryStatsSink {
    fn increment(&self, tag: &str, by: u32) {
        *self.tags.lock().entry(tag.to_string()).or_insert(0) += by as i64;
    }

    fn decrement(&self, tag: &str, by: u32) {
        *self.tags.lock().entry(tag.to_string()).or_insert(0) -= by as i64;
    }

    fn set(&self, count: i64) {
        self.total.store(count, Ordering::SeqCst);
    }
}

/// Per-tag deltas between an incoming timer's tags and the one it
/// replaces, accounting for numeric count changes per tag (spec §4.4
/// step 6). Returns `(adds, removes)`.
pub fn tag_deltas(
    new_tags: &BTreeMap<String, u32>,
    existing_tags: &BTreeMap<String, u32>,
) -> (BTreeMap<String, u32>, BTreeMap<String, u32>) {
    let mut adds = BTreeMap::new();
    let mut removes = BTreeMap::new();
    let all_keys = new_tags.keys().chain(existing_tags.keys());
    let mut seen = std::collections::BTreeSet::new();
    for key in all_keys {
        if !seen.insert(key.clone()) {
            continue;
        }
        let n = *new_tags.get(key).unwrap_or(&0);
        let e = *existing_tags.get(key).unwrap_or(&0);
        if n > e {
            adds.insert(key.clone(), n - e);
        } else if e > n {
            removes.insert(key.clone(), e - n);
        }
    }
    (adds, removes)
}

/// Applies a `(adds, removes)` pair to a sink.
pub fn apply_tag_deltas(
    sink: &dyn StatsSink,
    adds: &BTreeMap<String, u32>,
    removes: &BTreeMap<String, u32>,
) {
    for (tag, by) in adds {
        sink.increment(tag, *by);
    }
    for (tag, by) in removes {
        sink.decrement(tag, *by);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_deltas_splits_adds_and_removes() {
        let mut new_tags = BTreeMap::new();
        new_tags.insert("a".to_string(), 5);
        new_tags.insert("b".to_string(), 1);
        let mut existing = BTreeMap::new();
        existing.insert("a".to_string(), 2);
        existing.insert("c".to_string(), 3);

        let (adds, removes) = tag_deltas(&new_tags, &existing);
        assert_eq!(adds.get("a"), Some(&3));
        assert_eq!(adds.get("b"), Some(&1));
        assert_eq!(removes.get("c"), Some(&3));
        assert!(!removes.contains_key("a"));
    }

    #[test]
    fn in_memory_sink_tracks_applied_deltas() {
        let sink = InMemoryStatsSink::default();
        let mut new_tags = BTreeMap::new();
        new_tags.insert("a".to_string(), 5);
        let existing = BTreeMap::new();
        let (adds, removes) = tag_deltas(&new_tags, &existing);
        apply_tag_deltas(&sink, &adds, &removes);
        assert_eq!(sink.snapshot_tags().get("a"), Some(&5));
    }
}
