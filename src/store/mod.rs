//! The timer store (spec §4.3): hierarchical timing wheel, overflow heap,
//! id index and view-id index.
//!
//! ```text
//! insert ──▶ classify(next_pop_time, tick_timestamp) ──▶ overdue | short | long | heap
//!                                                              │
//! fetch_next_timers(now) ◀─── drains buckets, redistributes ──┘
//! ```

pub mod wheel;

use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::warn;

use crate::error::{Error, Result};
use crate::time::{heap_key, wrapping_lt, MonoMs};
use crate::timer::{Entry, TimerId};
use wheel::{
    Placement, LONG_WHEEL_NUM_BUCKETS, LONG_WHEEL_RESOLUTION_MS, SHORT_WHEEL_NUM_BUCKETS,
    SHORT_WHEEL_RESOLUTION_MS,
};

/// External liveness-probe hook (spec §4.3 "Health hook"): pinged on
/// every successful insert. The store only knows it as a flag to set.
pub trait HealthSink: Send + Sync {
    fn mark_healthy(&self);
}

/// A no-op health sink, used by default and in tests.
#[derive(Default)]
pub struct NullHealthSink;
impl HealthSink for NullHealthSink {
    fn mark_healthy(&self) {}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapItem {
    key: u64,
    id: TimerId,
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest pop time
        // (smallest key) is popped first.
        other.key.cmp(&self.key).then(other.id.cmp(&self.id))
    }
}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerStore {
    tick_timestamp: MonoMs,
    overdue: Vec<TimerId>,
    short: Vec<Vec<TimerId>>,
    long: Vec<Vec<TimerId>>,
    heap: BinaryHeap<HeapItem>,
    /// Pop time recorded per id, needed to classify on removal and to
    /// recompute heap keys relative to the wheel's current tick time.
    pop_times: HashMap<TimerId, MonoMs>,
    id_index: HashMap<TimerId, Entry>,
    view_id_index: HashMap<String, HashSet<TimerId>>,
    health: std::sync::Arc<dyn HealthSink>,
}

impl TimerStore {
    pub fn new(tick_timestamp: MonoMs) -> Self {
        Self::with_health(tick_timestamp, std::sync::Arc::new(NullHealthSink))
    }

    pub fn with_health(tick_timestamp: MonoMs, health: std::sync::Arc<dyn HealthSink>) -> Self {
        TimerStore {
            tick_timestamp: tick_timestamp - (tick_timestamp % SHORT_WHEEL_RESOLUTION_MS),
            overdue: Vec::new(),
            short: vec![Vec::new(); SHORT_WHEEL_NUM_BUCKETS],
            long: vec![Vec::new(); LONG_WHEEL_NUM_BUCKETS],
            heap: BinaryHeap::new(),
            pop_times: HashMap::new(),
            id_index: HashMap::new(),
            view_id_index: HashMap::new(),
            health,
        }
    }

    pub fn tick_timestamp(&self) -> MonoMs {
        self.tick_timestamp
    }

    pub fn len(&self) -> usize {
        self.id_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_index.is_empty()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.id_index.contains_key(&id)
    }

    fn place(&mut self, id: TimerId, pop_time: MonoMs) {
        self.pop_times.insert(id, pop_time);
        match wheel::classify(pop_time, self.tick_timestamp) {
            Placement::Overdue => self.overdue.push(id),
            Placement::Short(b) => self.short[b].push(id),
            Placement::Long(b) => self.long[b].push(id),
            Placement::Heap => self.heap.push(HeapItem {
                key: heap_key(pop_time, self.tick_timestamp),
                id,
            }),
        }
    }

    fn unplace(&mut self, id: TimerId, pop_time: MonoMs) {
        let found = match wheel::classify(pop_time, self.tick_timestamp) {
            Placement::Overdue => remove_from_vec(&mut self.overdue, id),
            Placement::Short(b) => remove_from_vec(&mut self.short[b], id),
            Placement::Long(b) => remove_from_vec(&mut self.long[b], id),
            Placement::Heap => self.remove_from_heap(id),
        };
        if !found {
            // Consistency fallback (spec §4.3 "Cancellation"): sweep
            // every structure before giving up.
            warn!(timer_id = id, "store inconsistency: sweeping all buckets");
            let _ = remove_from_vec(&mut self.overdue, id)
                || self.short.iter_mut().any(|b| remove_from_vec(b, id))
                || self.long.iter_mut().any(|b| remove_from_vec(b, id))
                || self.remove_from_heap(id);
        }
        self.pop_times.remove(&id);
    }

    fn remove_from_heap(&mut self, id: TimerId) -> bool {
        if !self.heap.iter().any(|h| h.id == id) {
            return false;
        }
        let items: Vec<HeapItem> = self.heap.drain().filter(|h| h.id != id).collect();
        self.heap = items.into_iter().collect();
        true
    }

    fn index_view_id(&mut self, id: TimerId, view_id: &str) {
        self.view_id_index
            .entry(view_id.to_string())
            .or_default()
            .insert(id);
    }

    fn deindex_view_id(&mut self, id: TimerId, view_id: &str) {
        if let Some(set) = self.view_id_index.get_mut(view_id) {
            set.remove(&id);
            if set.is_empty() {
                self.view_id_index.remove(view_id);
            }
        }
    }

    /// Inserts a new entry at `next_pop_time` (spec §4.3 "Placement on
    /// insert"). The caller (the handler) computes `next_pop_time`, since
    /// only it knows the local node's position in the replica/site list.
    pub fn insert(&mut self, entry: Entry, next_pop_time: MonoMs) {
        let id = entry.id();
        let view_id = entry.active().cluster_view_id.clone();
        self.place(id, next_pop_time);
        self.index_view_id(id, &view_id);
        if let Some(old) = entry.information() {
            if old.cluster_view_id != view_id {
                self.index_view_id(id, &old.cluster_view_id);
            }
        }
        self.id_index.insert(id, entry);
        self.health.mark_healthy();
    }

    /// Point fetch: removes the entry entirely and hands ownership to the
    /// caller (spec §4.3 "Point fetch").
    pub fn fetch(&mut self, id: TimerId) -> Option<Entry> {
        let entry = self.id_index.remove(&id)?;
        if let Some(pop_time) = self.pop_times.get(&id).copied() {
            self.unplace(id, pop_time);
        }
        self.deindex_view_id(id, &entry.active().cluster_view_id);
        if let Some(old) = entry.information() {
            self.deindex_view_id(id, &old.cluster_view_id);
        }
        Some(entry)
    }

    /// Looks at an entry without removing it.
    pub fn peek(&self, id: TimerId) -> Option<&Entry> {
        self.id_index.get(&id)
    }

    /// Cancellation (spec §4.3): removes a timer by id, same as `fetch`
    /// but the caller discards the result.
    pub fn remove(&mut self, id: TimerId) -> Result<()> {
        self.fetch(id)
            .map(|_| ())
            .ok_or(Error::StoreInconsistency { timer_id: id })
    }

    /// Advances the wheel to `now` and returns every entry whose pop time
    /// has arrived (spec §4.3 "Advancing (tick)").
    pub fn fetch_next_timers(&mut self, now: MonoMs) -> Vec<Entry> {
        let mut out_ids: Vec<TimerId> = Vec::new();
        out_ids.append(&mut self.overdue);

        while wrapping_lt(self.tick_timestamp, now) || self.tick_timestamp == now {
            let bucket = (self.tick_timestamp / SHORT_WHEEL_RESOLUTION_MS) as usize
                % SHORT_WHEEL_NUM_BUCKETS;
            out_ids.append(&mut self.short[bucket]);

            let next_tick = self.tick_timestamp.wrapping_add(SHORT_WHEEL_RESOLUTION_MS);

            // Crossing a long-wheel-resolution boundary: redistribute the
            // newly-current long bucket into the short wheel.
            if next_tick % LONG_WHEEL_RESOLUTION_MS == 0 {
                let long_bucket = (next_tick / LONG_WHEEL_RESOLUTION_MS) as usize
                    % LONG_WHEEL_NUM_BUCKETS;
                let ids: Vec<TimerId> = std::mem::take(&mut self.long[long_bucket]);
                for id in ids {
                    if let Some(pop_time) = self.pop_times.get(&id).copied() {
                        self.tick_timestamp = next_tick;
                        self.place(id, pop_time);
                        self.tick_timestamp = self.tick_timestamp.wrapping_sub(SHORT_WHEEL_RESOLUTION_MS);
                    }
                }
            }

            // Crossing a long-wheel-period boundary: drain the heap of
            // everything now within one long-wheel span and redistribute.
            if next_tick % (LONG_WHEEL_RESOLUTION_MS.wrapping_mul(LONG_WHEEL_NUM_BUCKETS as u32)) == 0 {
                let horizon = next_tick.wrapping_add(
                    LONG_WHEEL_RESOLUTION_MS.wrapping_mul(LONG_WHEEL_NUM_BUCKETS as u32),
                );
                let mut ready = Vec::new();
                let remaining: Vec<HeapItem> = self
                    .heap
                    .drain()
                    .filter(|item| {
                        let pop_time = self.pop_times.get(&item.id).copied().unwrap_or(item.id as u32);
                        if wrapping_lt(pop_time, horizon) {
                            ready.push((item.id, pop_time));
                            false
                        } else {
                            true
                        }
                    })
                    .collect();
                self.heap = remaining.into_iter().collect();
                self.tick_timestamp = next_tick;
                for (id, pop_time) in ready {
                    self.place(id, pop_time);
                }
                self.tick_timestamp = self.tick_timestamp.wrapping_sub(SHORT_WHEEL_RESOLUTION_MS);
            }

            self.tick_timestamp = next_tick;
        }

        let mut out = Vec::with_capacity(out_ids.len());
        for id in out_ids {
            if let Some(entry) = self.id_index.remove(&id) {
                self.pop_times.remove(&id);
                self.deindex_view_id(id, &entry.active().cluster_view_id);
                if let Some(old) = entry.information() {
                    self.deindex_view_id(id, &old.cluster_view_id);
                }
                out.push(entry);
            }
        }
        out
    }

    /// Resync iterator (spec §4.3 "Resync iterator"): every active timer
    /// whose `next_pop_time >= from_time`, in increasing pop-time order.
    pub fn iter_from(&self, from_time: MonoMs) -> Vec<&Entry> {
        let mut matches: Vec<&Entry> = self
            .id_index
            .values()
            .filter(|e| {
                let pop_time = self.pop_times.get(&e.id()).copied().unwrap_or(0);
                wrapping_lt(from_time, pop_time) || pop_time == from_time
            })
            .collect();
        matches.sort_by_key(|e| self.pop_times.get(&e.id()).copied().unwrap_or(0));
        matches
    }

    /// All ids whose active or information timer still carries `view_id`
    /// (spec §4.3 "View-id index").
    pub fn ids_for_view(&self, view_id: &str) -> Vec<TimerId> {
        self.view_id_index
            .get(view_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn remove_from_vec(v: &mut Vec<TimerId>, id: TimerId) -> bool {
    if let Some(pos) = v.iter().position(|x| *x == id) {
        v.remove(pos);
        true
    } else {
        false
    }
}
