//! The timer entity (spec §4.1) and the store's per-id entry (spec §3.2).
//!
//! ```text
//! ┌────────────┐   from_json/to_json   ┌──────────────┐
//! │  timer::json │◀──────────────────▶│    Timer     │
//! └────────────┘                       └──────┬───────┘
//!                                              │ held by
//!                                              ▼
//!                                        ┌───────────┐
//!                                        │   Entry   │  (store's TimerPair)
//!                                        └───────────┘
//! ```

pub mod id_gen;
pub mod json;
pub mod url;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::time::{wrapping_add, MonoMs, REPLICA_STAGGER_MS};

/// Opaque, globally-unique 64-bit timer identifier (spec §3.1).
pub type TimerId = u64;

/// One scheduled callback. See spec §3.1 for the full attribute list and
/// invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    pub start_time_mono_ms: MonoMs,
    pub interval_ms: u32,
    pub repeat_for_ms: u32,
    pub sequence_number: u32,
    pub cluster_view_id: String,
    pub replicas: Vec<String>,
    pub extra_replicas: Vec<String>,
    pub sites: Vec<String>,
    pub tags: BTreeMap<String, u32>,
    pub callback_url: String,
    pub callback_body: String,
    pub replication_factor: u32,
    /// Bit *i* is 0 once replica *i* has confirmed the new placement.
    /// Only meaningful while this timer is the `information` half of an
    /// [`Entry::Transitioning`] pair.
    pub replica_tracker: u32,
}

impl Timer {
    /// A timer is a tombstone iff both URL and body are empty (spec §3.1).
    pub fn is_tombstone(&self) -> bool {
        self.callback_url.is_empty() && self.callback_body.is_empty()
    }

    /// Index of this node in `replicas`, if it's a replica at all.
    pub fn replica_index(&self, me: &str) -> Option<usize> {
        self.replicas.iter().position(|r| r == me)
    }

    /// Index of this node in `sites`, if it's a participating site.
    pub fn site_index(&self, site: &str) -> Option<usize> {
        self.sites.iter().position(|s| s == site)
    }

    /// Whether `me` is a replica of this timer at all.
    pub fn is_local(&self, me: &str) -> bool {
        self.replica_index(me).is_some()
    }

    /// Whether `me` is the last (lowest-priority) replica in the list.
    pub fn is_last_replica(&self, me: &str) -> bool {
        match self.replica_index(me) {
            Some(idx) => idx + 1 == self.replicas.len(),
            None => false,
        }
    }

    pub fn is_matching_cluster_view_id(&self, view_id: &str) -> bool {
        self.cluster_view_id == view_id
    }

    /// Converts this timer in place into its own tombstone (spec §3.4,
    /// §4.1 `become_tombstone`): clears url/body and sets `repeat_for_ms`
    /// so the tombstone outlives any copy of the original still
    /// propagating through the cluster.
    pub fn become_tombstone(&mut self) {
        self.callback_url.clear();
        self.callback_body.clear();
        self.repeat_for_ms = self
            .interval_ms
            .saturating_mul(self.sequence_number.saturating_add(1));
    }

    /// The time, in monotonic ms, at which this timer is next due to pop
    /// on `me`, including the replica/site stagger (spec §3.1, §4.2). If
    /// `me` isn't one of `replicas` (shouldn't happen for a timer actually
    /// stored on this node), the delay is computed as if at position 0.
    pub fn next_pop_time(&self, me: &str) -> MonoMs {
        let replica_idx = self.replica_index(me).unwrap_or(0);
        let site_idx = self.sites.first().map_or(0, |local_site| {
            self.site_index(local_site).unwrap_or(0)
        });
        self.next_pop_time_at(replica_idx, site_idx)
    }

    /// Delay for a timer known to be replica `replica_idx` of
    /// `replica_count`, at site `site_idx`, per spec §4.2.
    pub fn delay_for_position(replica_idx: usize, replica_count: usize, site_idx: usize) -> u32 {
        let replica_delay = (replica_idx as u32).saturating_mul(REPLICA_STAGGER_MS);
        let site_delay = (site_idx as u32)
            .saturating_mul(replica_count as u32)
            .saturating_mul(REPLICA_STAGGER_MS);
        replica_delay.saturating_add(site_delay)
    }

    /// `next_pop_time` computed for a specific resolved position, used by
    /// the handler once it knows which replica/site index `me` occupies.
    pub fn next_pop_time_at(&self, replica_idx: usize, site_idx: usize) -> MonoMs {
        let base = wrapping_add(
            self.start_time_mono_ms,
            self.interval_ms
                .saturating_mul(self.sequence_number.saturating_add(1)),
        );
        let delay = Self::delay_for_position(replica_idx, self.replicas.len().max(1), site_idx);
        wrapping_add(base, delay)
    }

    /// Whether this timer has exhausted its repeat budget and the next
    /// firing should tombstone it instead of rearming (spec §3.4 step 4).
    pub fn exhausted(&self) -> bool {
        let next_total = (self.sequence_number as u64 + 1) * self.interval_ms as u64;
        (self.interval_ms == 0 && self.repeat_for_ms == 0)
            || next_total > self.repeat_for_ms as u64
    }
}

/// The store's per-id entry (spec §3.2): at most one active timer plus,
/// during cross-epoch resync, a retained previous-epoch "information"
/// view. Modelled as a sum type per the design note in spec §9 rather
/// than two nullable pointers.
#[derive(Debug, Clone)]
pub enum Entry {
    /// Only the current-epoch timer is known on this node.
    Active(Timer),
    /// The current-epoch timer plus a previous-epoch view still owed to
    /// at least one old-epoch replica (`tracker` has a bit set per
    /// outstanding replica, spec §3.2).
    Transitioning { active: Timer, old: Timer, tracker: u32 },
}

impl Entry {
    pub fn id(&self) -> TimerId {
        self.active().id
    }

    pub fn active(&self) -> &Timer {
        match self {
            Entry::Active(t) => t,
            Entry::Transitioning { active, .. } => active,
        }
    }

    pub fn active_mut(&mut self) -> &mut Timer {
        match self {
            Entry::Active(t) => t,
            Entry::Transitioning { active, .. } => active,
        }
    }

    pub fn information(&self) -> Option<&Timer> {
        match self {
            Entry::Active(_) => None,
            Entry::Transitioning { old, .. } => Some(old),
        }
    }

    /// Clears tracker bit `replica_index`. Returns `true` if the
    /// information timer has no outstanding bits left and should be
    /// reaped (spec §3.2, §3.4 step 6).
    pub fn clear_tracker_bit(&mut self, replica_index: u32) -> bool {
        match self {
            Entry::Active(_) => false,
            Entry::Transitioning { tracker, active, .. } => {
                *tracker &= !(1u32 << replica_index.min(31));
                if *tracker == 0 {
                    let promoted = active.clone();
                    *self = Entry::Active(promoted);
                    true
                } else {
                    false
                }
            }
        }
    }
}
