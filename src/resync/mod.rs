//! Resync (spec §4.6): the scale-in/scale-out handshake. Triggered
//! out-of-band per peer; walks that peer's store for timers whose
//! replica set now includes us, decides what to store/replicate/
//! tombstone, then clears tracker bits on the peer once a page settles.
//!
//! The decision logic is a pure function over one [`collab::ResyncEntry`]
//! (`classify_and_decide`), independently testable against fixtures
//! without a real peer — mirroring how the teacher tests `DialogManager`
//! logic against fake transports rather than real sockets.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::collab::ResyncEntry;
use crate::error::Result;
use crate::handler::TimerHandler;
use crate::time::MonoMs;
use crate::timer::{Timer, TimerId};

/// Issues the GET/DELETE described in spec §4.6 against one peer. A
/// collaborator interface: the real implementation speaks HTTP, tests
/// supply a fake that replays fixture pages.
#[async_trait]
pub trait ResyncPeerClient: Send + Sync {
    async fn fetch_page(
        &self,
        peer: &str,
        node_for_replicas: &str,
        cluster_view_id: &str,
        time_from: MonoMs,
        range: Option<usize>,
    ) -> Result<ResyncPageResponse>;

    async fn replicate(&self, peer: &str, timer: &Timer) -> Result<()>;

    async fn clear_references(&self, peer: &str, refs: &[(TimerId, u32)]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ResyncPageResponse {
    pub entries: Vec<ResyncEntry>,
    pub more: bool,
}

/// What to do with one resync entry (spec §4.6 step 2), as a pure
/// decision separate from actually calling out to peers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResyncDecision {
    pub store_locally: bool,
    /// Peers strictly below our rank in the new replica list that were
    /// not at the same-or-better position in the old list: they need the
    /// live timer replicated to them.
    pub replicate_to: Vec<String>,
    /// Old replicas above our rank that are no longer in the new replica
    /// list: they need a tombstone replicated to them.
    pub tombstone_to: Vec<String>,
    /// Our rank in the new replica list, `None` if we're not in it at
    /// all. Reported back to the peer via the references DELETE.
    pub new_level: Option<u32>,
}

/// Classifies `me`'s position in the old and new replica lists for one
/// entry and decides the store/replicate/tombstone actions (spec §4.6
/// step 2).
pub fn classify_and_decide(entry: &ResyncEntry, me: &str) -> ResyncDecision {
    let old_level = entry.old_replicas.iter().position(|r| r == me);
    let new_level = entry.timer.replicas.iter().position(|r| r == me);

    let store_locally = match (old_level, new_level) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(old), Some(new)) => old >= new,
    };

    let mut replicate_to = Vec::new();
    if let Some(new) = new_level {
        for (idx, replica) in entry.timer.replicas.iter().enumerate() {
            if idx >= new {
                continue;
            }
            let was_same_or_better = old_level.map(|old| old <= idx).unwrap_or(false);
            if !was_same_or_better {
                replicate_to.push(replica.clone());
            }
        }
    }

    let mut tombstone_to = Vec::new();
    if let Some(new) = new_level {
        for (idx, old_replica) in entry.old_replicas.iter().enumerate() {
            if idx < new && !entry.timer.replicas.contains(old_replica) {
                tombstone_to.push(old_replica.clone());
            }
        }
    }

    ResyncDecision {
        store_locally,
        replicate_to,
        tombstone_to,
        new_level: new_level.map(|n| n as u32),
    }
}

/// Runs the full resync loop against one peer to completion (spec §4.6:
/// "repeat until the GET returns 200, not 206"). Failures against this
/// peer are logged by the caller and do not abort resync against others
/// — this function itself returns `Err` only for a fatal local problem
/// (e.g. the handler rejecting our own locally-stored timer), since
/// per-item transport failures are swallowed at the `ResyncPeerClient`
/// implementation boundary and simply skip that item.
pub async fn run_resync_against_peer(
    handler: &TimerHandler,
    client: &dyn ResyncPeerClient,
    peer: &str,
    me: &str,
    cluster_view_id: &str,
    page_range: Option<usize>,
) -> Result<()> {
    let mut time_from: MonoMs = 0;
    loop {
        let page = client
            .fetch_page(peer, me, cluster_view_id, time_from, page_range)
            .await?;

        let mut to_clear: Vec<(TimerId, u32)> = Vec::new();
        let mut next_time_from = time_from;

        for entry in &page.entries {
            let decision = classify_and_decide(entry, me);

            if decision.store_locally {
                handler.add_timer(entry.timer.clone())?;
            }

            for target in &decision.replicate_to {
                let _ = client.replicate(target, &entry.timer).await;
            }

            for target in &decision.tombstone_to {
                let mut tombstone = entry.timer.clone();
                tombstone.become_tombstone();
                let _ = client.replicate(target, &tombstone).await;
            }

            if let Some(new_level) = decision.new_level {
                to_clear.push((entry.timer.id, new_level));
            }

            next_time_from = entry.timer.next_pop_time(me);
        }

        if !to_clear.is_empty() {
            let _ = client.clear_references(peer, &to_clear).await;
        }

        if !page.more {
            break;
        }
        time_from = next_time_from;
    }
    Ok(())
}

/// Runs a full resync pass (spec §4.6: "triggered out-of-band... for
/// each peer in the (shuffled) cluster other than self"). The shuffle
/// exists so that, when an operator kicks off resync cluster-wide at
/// roughly the same moment on every node, peers don't all hammer the
/// same first member of `cluster` in lockstep.
///
/// Failures against one peer are logged and resync continues against
/// the rest (spec §4.6: "failures at individual peers log and
/// continue").
pub async fn run_resync_against_cluster(
    handler: &TimerHandler,
    client: &dyn ResyncPeerClient,
    cluster: &[String],
    me: &str,
    cluster_view_id: &str,
    page_range: Option<usize>,
) {
    let mut peers: Vec<&str> = cluster
        .iter()
        .map(String::as_str)
        .filter(|&p| p != me)
        .collect();
    peers.shuffle(&mut rand::thread_rng());

    for peer in peers {
        if let Err(err) =
            run_resync_against_peer(handler, client, peer, me, cluster_view_id, page_range).await
        {
            warn!(%peer, %err, "resync against peer failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(old_replicas: &[&str], new_replicas: &[&str]) -> ResyncEntry {
        ResyncEntry {
            timer: Timer {
                id: 1,
                start_time_mono_ms: 0,
                interval_ms: 1000,
                repeat_for_ms: 1000,
                sequence_number: 0,
                cluster_view_id: "v2".into(),
                replicas: new_replicas.iter().map(|s| s.to_string()).collect(),
                extra_replicas: vec![],
                sites: vec![],
                tags: BTreeMap::new(),
                callback_url: "http://x".into(),
                callback_body: "y".into(),
                replication_factor: new_replicas.len() as u32,
                replica_tracker: 0,
            },
            old_replicas: old_replicas.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn gains_primary_role_stores_and_pulls_in_no_replication() {
        // me was backup (level 1), is now primary (level 0): store, no
        // replicate-out needed (we improved position), no tombstone.
        let e = entry(&["other", "me"], &["me", "other"]);
        let d = classify_and_decide(&e, "me");
        assert!(d.store_locally);
        assert_eq!(d.new_level, Some(0));
        assert!(d.replicate_to.is_empty());
    }

    #[test]
    fn dropped_from_replica_set_does_not_store() {
        let e = entry(&["me", "other"], &["other", "third"]);
        let d = classify_and_decide(&e, "me");
        assert!(!d.store_locally);
        assert_eq!(d.new_level, None);
    }

    #[test]
    fn freshly_added_backup_stores_and_replicates_up_to_new_primary() {
        // me wasn't a replica at all before; now a backup (level 1)
        // behind a brand new primary, which also needs the timer.
        let e = entry(&["someone-else"], &["new-primary", "me"]);
        let d = classify_and_decide(&e, "me");
        assert!(d.store_locally);
        assert_eq!(d.replicate_to, vec!["new-primary".to_string()]);
    }

    #[test]
    fn old_replica_ranked_above_us_and_dropped_gets_tombstoned() {
        // me demoted from primary (old level 0 implied by "other1" being
        // former primary) to backup (new level 1); "other1" no longer
        // appears in the new replica list at all, so it's told to drop.
        let e = entry(&["other1", "me"], &["fresh", "me"]);
        let d = classify_and_decide(&e, "me");
        assert_eq!(d.tombstone_to, vec!["other1".to_string()]);
    }
}
