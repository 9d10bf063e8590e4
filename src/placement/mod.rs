//! Rendezvous-hashing placement (spec §4.2).
//!
//! For a given timer id, every cluster member is ranked by
//! `hash(id, member_seed)`; the primary is the lowest hash, and the
//! backups are taken from the *highest* hashes of the remaining members
//! so that scale-up moves the smallest possible number of timers and
//! never swaps a primary for a backup or vice versa.

use crate::timer::TimerId;

/// A cluster member's address, e.g. `"10.0.0.1:9999"`.
pub type MemberId = String;

/// Per-epoch, per-member seed used in the rendezvous hash. Generated once
/// per cluster epoch (spec §4.2) and guaranteed unique within an epoch by
/// the same collision-increment trick used for per-timer ranking.
pub type MemberSeed = u32;

/// A cluster view: the ordered member list plus their seeds for this
/// epoch, and the view id that names this epoch.
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub view_id: String,
    pub members: Vec<MemberId>,
    pub seeds: Vec<MemberSeed>,
}

impl ClusterView {
    /// Builds per-member seeds for a freshly assembled membership list,
    /// deterministically from member position, then resolves seed
    /// collisions with the same increment rule used for per-timer hashes.
    pub fn new(view_id: String, members: Vec<MemberId>) -> Self {
        let mut seeds: Vec<MemberSeed> = members
            .iter()
            .enumerate()
            .map(|(i, m)| fnv1a_32(m.as_bytes()).wrapping_add(i as u32))
            .collect();
        dedupe_collisions(&mut seeds);
        ClusterView {
            view_id,
            members,
            seeds,
        }
    }
}

/// 32-bit FNV-1a, used as the base hash function for both member seeds and
/// the rendezvous ranking itself. Chosen for being a small, dependency-free,
/// well-understood non-cryptographic hash — exactly what the original
/// Chronos's pluggable `Hasher` interface (spec §9 design note) abstracts
/// over; this crate picks one concrete implementation rather than making
/// hash choice runtime-pluggable, since nothing in spec requires swapping it.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for b in bytes {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

/// `hash(id, member_seed)` from spec §4.2.
fn rendezvous_hash(id: TimerId, seed: MemberSeed) -> u32 {
    let mut bytes = [0u8; 12];
    bytes[0..8].copy_from_slice(&id.to_le_bytes());
    bytes[8..12].copy_from_slice(&seed.to_le_bytes());
    fnv1a_32(&bytes)
}

/// Resolves same-value collisions deterministically: later entries in the
/// slice have their value incremented until unique (spec §4.2). Order is
/// load-bearing — this is what makes the rule order-sensitive as the spec
/// describes.
fn dedupe_collisions(values: &mut [u32]) {
    let mut seen = std::collections::HashSet::new();
    for v in values.iter_mut() {
        while seen.contains(v) {
            *v = v.wrapping_add(1);
        }
        seen.insert(*v);
    }
}

/// One member's rank for a given timer id: its index into the cluster's
/// member list, plus its (collision-resolved) hash value.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    member_idx: usize,
    hash: u32,
}

/// Ranks every member of `view` for `id`, resolving collisions in member
/// order (spec §4.2: "incrementing the later collider's hash").
fn rank_members(id: TimerId, view: &ClusterView) -> Vec<Ranked> {
    let mut hashes: Vec<u32> = view
        .seeds
        .iter()
        .map(|seed| rendezvous_hash(id, *seed))
        .collect();
    dedupe_collisions(&mut hashes);
    hashes
        .into_iter()
        .enumerate()
        .map(|(member_idx, hash)| Ranked { member_idx, hash })
        .collect()
}

/// Chooses `replication_factor` replicas for `id` under `view`: the
/// lowest-hash member as primary, then the `replication_factor - 1`
/// highest-hash members as backups, in descending-hash order (spec §4.2).
pub fn choose_replicas(
    id: TimerId,
    view: &ClusterView,
    replication_factor: u32,
) -> Vec<MemberId> {
    if view.members.is_empty() {
        return Vec::new();
    }
    let mut ranked = rank_members(id, view);
    ranked.sort_by_key(|r| r.hash);

    let rf = (replication_factor as usize).min(view.members.len());
    if rf == 0 {
        return Vec::new();
    }

    let primary = ranked[0];
    let mut backups: Vec<Ranked> = ranked[1..].to_vec();
    backups.sort_by_key(|r| std::cmp::Reverse(r.hash));
    backups.truncate(rf - 1);

    let mut result = vec![view.members[primary.member_idx].clone()];
    result.extend(backups.iter().map(|r| view.members[r.member_idx].clone()));
    result
}

/// Recomputes replicas under `new_view`, given the `old_view` a timer was
/// last placed under, returning `(replicas, extra_replicas)` — members
/// that held the timer under `old_view` but no longer do (spec §3.1
/// `extra_replicas`, §4.1 `update_cluster_information`).
pub fn update_placement(
    id: TimerId,
    old_view: &ClusterView,
    old_replicas: &[MemberId],
    new_view: &ClusterView,
    replication_factor: u32,
) -> (Vec<MemberId>, Vec<MemberId>) {
    let new_replicas = choose_replicas(id, new_view, replication_factor);
    let extra: Vec<MemberId> = old_replicas
        .iter()
        .filter(|m| !new_replicas.contains(m) && old_view.members.contains(m))
        .cloned()
        .collect();
    (new_replicas, extra)
}

/// Site placement: ranks site names the same way member addresses are
/// ranked, picking the lowest-hash as the local/primary site; remote
/// sites follow in the caller-supplied configured order (spec §4.2).
pub fn choose_sites(id: TimerId, configured_sites: &[String]) -> Vec<String> {
    if configured_sites.is_empty() {
        return Vec::new();
    }
    let view = ClusterView::new(String::new(), configured_sites.to_vec());
    let ranked = rank_members(id, &view);
    let primary_idx = ranked
        .iter()
        .min_by_key(|r| r.hash)
        .map(|r| r.member_idx)
        .unwrap_or(0);

    let mut sites = vec![configured_sites[primary_idx].clone()];
    sites.extend(
        configured_sites
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != primary_idx)
            .map(|(_, s)| s.clone()),
    );
    sites
}

/// Merges a timer's existing site ordering with the currently configured
/// sites (spec §4.2 "On every reinsert the handler preserves the existing
/// site ordering"): drops sites no longer configured, appends newly added
/// ones at the end, keeping the rest in their existing relative order.
pub fn merge_site_order(existing: &[String], configured: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = existing
        .iter()
        .filter(|s| configured.contains(s))
        .cloned()
        .collect();
    for site in configured {
        if !merged.contains(site) {
            merged.push(site.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn view(members: &[&str]) -> ClusterView {
        ClusterView::new(
            "v1".into(),
            members.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn replicas_has_requested_length() {
        let v = view(&["a", "b", "c", "d"]);
        let r = choose_replicas(42, &v, 2);
        assert_eq!(r.len(), 2);
        assert_ne!(r[0], r[1]);
    }

    #[test]
    fn primary_stable_or_becomes_new_node_on_scale_up() {
        // Scenario 4 (spec §8.2): sample many ids, grow {A,B,C,D} -> +E,
        // and check every primary change lands on E, never a backup swap.
        let before = view(&["A", "B", "C", "D"]);
        let after = view(&["A", "B", "C", "D", "E"]);
        let mut changed_to_other_than_e = 0;
        let mut backup_became_primary = 0;

        for id in 0u64..4096 {
            let before_replicas = choose_replicas(id, &before, 2);
            let after_replicas = choose_replicas(id, &after, 2);
            let before_primary = &before_replicas[0];
            let after_primary = &after_replicas[0];

            if before_primary != after_primary && after_primary != "E" {
                changed_to_other_than_e += 1;
            }
            if before_replicas.get(1) == Some(after_primary) {
                backup_became_primary += 1;
            }
        }

        assert_eq!(changed_to_other_than_e, 0);
        assert_eq!(backup_became_primary, 0);
    }

    #[test]
    fn balanced_distribution_within_10_percent() {
        let v = view(&["A", "B", "C", "D"]);
        let mut counts: HashMap<String, u32> = HashMap::new();
        let n = 10_000u64;
        for id in 0..n {
            let replicas = choose_replicas(id, &v, 1);
            *counts.entry(replicas[0].clone()).or_insert(0) += 1;
        }
        let expected = n as f64 / v.members.len() as f64;
        for count in counts.values() {
            let frac = (*count as f64 - expected).abs() / expected;
            assert!(frac < 0.10, "fraction {frac} exceeds 10%");
        }
    }

    #[test]
    fn merge_site_order_drops_removed_and_appends_new() {
        let existing = vec!["site-b".to_string(), "site-a".to_string()];
        let configured = vec!["site-a".to_string(), "site-c".to_string()];
        let merged = merge_site_order(&existing, &configured);
        assert_eq!(merged, vec!["site-a".to_string(), "site-c".to_string()]);
    }

    #[test]
    fn collision_resolution_is_deterministic_given_order() {
        let mut values = vec![5u32, 5u32, 5u32];
        dedupe_collisions(&mut values);
        assert_eq!(values, vec![5, 6, 7]);
    }
}
