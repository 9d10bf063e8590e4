//! URL rendering and suffix parsing for `PUT`/`DELETE /timers/{id}{suffix}`
//! (spec §4.1 `url()`, §6.1, §6.3 `timers.id-format`).

use super::{Timer, TimerId};

/// Which suffix form a deployment is configured to use. Both forms must
/// round-trip back to an id and a hint, per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    WithoutReplicas,
    WithReplicas,
}

/// Decoded suffix: either an explicit replication-factor hint or a
/// 16-hex-digit bloom filter of replica addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suffix {
    ReplicationFactor(u32),
    ReplicaBloom(u64),
}

/// Renders `http://{host}/timers/{id_hex16}{suffix}`.
pub fn render(timer: &Timer, host: &str, format: IdFormat) -> String {
    let id_hex = format!("{:016x}", timer.id);
    let suffix = match format {
        IdFormat::WithoutReplicas => format!("-{}", timer.replication_factor),
        IdFormat::WithReplicas => format!("{:016x}", replica_bloom(&timer.replicas)),
    };
    format!("http://{host}/timers/{id_hex}{suffix}")
}

/// A cheap, deterministic 64-bit bloom-style digest of a replica list,
/// used only to round-trip the id-format suffix — not a cryptographic or
/// collision-resistant hash.
pub fn replica_bloom(replicas: &[String]) -> u64 {
    let mut acc: u64 = 0;
    for replica in replicas {
        let mut h: u64 = 1469598103934665603; // FNV offset basis
        for byte in replica.as_bytes() {
            h ^= *byte as u64;
            h = h.wrapping_mul(1099511628211); // FNV prime
        }
        acc |= 1u64 << (h % 64);
    }
    acc
}

/// Parses `{id16hex}{suffix}` from a path segment (spec §6.1).
pub fn parse_path(segment: &str) -> Option<(TimerId, Suffix)> {
    if segment.len() < 16 {
        return None;
    }
    let (id_hex, rest) = segment.split_at(16);
    let id = TimerId::from_str_radix(id_hex, 16).ok()?;

    if let Some(rf_str) = rest.strip_prefix('-') {
        let rf: u32 = rf_str.parse().ok()?;
        return Some((id, Suffix::ReplicationFactor(rf)));
    }

    if rest.len() == 16 {
        let bloom = u64::from_str_radix(rest, 16).ok()?;
        return Some((id, Suffix::ReplicaBloom(bloom)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_timer() -> Timer {
        Timer {
            id: 0x1234,
            start_time_mono_ms: 0,
            interval_ms: 1000,
            repeat_for_ms: 1000,
            sequence_number: 0,
            cluster_view_id: "v1".into(),
            replicas: vec!["a:1".into(), "b:2".into()],
            extra_replicas: vec![],
            sites: vec![],
            tags: BTreeMap::new(),
            callback_url: "http://x".into(),
            callback_body: "y".into(),
            replication_factor: 2,
            replica_tracker: 0,
        }
    }

    #[test]
    fn without_replicas_round_trips() {
        let t = sample_timer();
        let rendered = render(&t, "node1:9999", IdFormat::WithoutReplicas);
        let path = rendered.split("/timers/").nth(1).unwrap();
        let (id, suffix) = parse_path(path).unwrap();
        assert_eq!(id, t.id);
        assert_eq!(suffix, Suffix::ReplicationFactor(2));
    }

    #[test]
    fn with_replicas_round_trips() {
        let t = sample_timer();
        let rendered = render(&t, "node1:9999", IdFormat::WithReplicas);
        let path = rendered.split("/timers/").nth(1).unwrap();
        let (id, suffix) = parse_path(path).unwrap();
        assert_eq!(id, t.id);
        assert_eq!(suffix, Suffix::ReplicaBloom(replica_bloom(&t.replicas)));
    }
}
