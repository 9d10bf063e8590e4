//! Global mutable configuration (spec §6.3, §9 "Global mutable
//! configuration"): the current cluster view, site topology, local
//! identity and the handful of runtime-tunable constants. Guarded by a
//! single `parking_lot::RwLock`, mirroring the teacher's
//! `infra_common::config::dynamic::DynamicConfig` (an `Arc<RwLock<T>>`
//! snapshot-on-read, batch-update-on-write shape).

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::placement::ClusterView;
use crate::timer::url::IdFormat;

/// Recognised `timers.id-format` values (spec §6.3).
fn parse_id_format(s: &str) -> Result<IdFormat> {
    match s {
        "with_replicas" => Ok(IdFormat::WithReplicas),
        "without_replicas" => Ok(IdFormat::WithoutReplicas),
        other => Err(Error::Config(format!("unrecognised timers.id-format: {other}"))),
    }
}

/// A remote site's geo-redundancy replication endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSite {
    pub name: String,
    pub endpoint: String,
}

/// One point-in-time snapshot of the global configuration. Handler
/// operations take a read snapshot once per call (spec §9), rather than
/// holding the lock across the whole operation.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub cluster_view: ClusterView,
    pub joining: Vec<String>,
    pub leaving: Vec<String>,
    pub local_member: String,
    pub replication_factor: u32,
    pub sites: Vec<String>,
    pub local_site: String,
    pub remote_sites: Vec<RemoteSite>,
    pub id_format: IdFormat,
    pub network_delay_ms: u32,
    pub resync_default_page_size: usize,
    pub instance_id: u8,
    pub deployment_id: u8,
    pub max_ttl_secs: u64,
    pub dns_servers: Vec<String>,
    pub http_bind_address: String,
    pub http_bind_port: u16,
    pub http_threads: usize,
}

impl GlobalConfig {
    /// A node is a valid target for a resync GET if it's part of the
    /// current membership or is in the process of joining or leaving
    /// (spec §4.6, §7 `NodeNotInCluster`).
    pub fn is_cluster_member(&self, node: &str) -> bool {
        self.cluster_view.members.iter().any(|m| m == node)
            || self.joining.iter().any(|m| m == node)
            || self.leaving.iter().any(|m| m == node)
    }

    pub fn remote_site_endpoint(&self, site: &str) -> Option<&str> {
        self.remote_sites
            .iter()
            .find(|s| s.name == site)
            .map(|s| s.endpoint.as_str())
    }

    /// Builds a config with a single-member cluster, useful for tests and
    /// as a starting point before the first config load.
    pub fn standalone(local_member: impl Into<String>) -> Self {
        let local_member = local_member.into();
        GlobalConfig {
            cluster_view: ClusterView::new("v0".into(), vec![local_member.clone()]),
            joining: Vec::new(),
            leaving: Vec::new(),
            local_member,
            replication_factor: 1,
            sites: Vec::new(),
            local_site: String::new(),
            remote_sites: Vec::new(),
            id_format: IdFormat::WithoutReplicas,
            network_delay_ms: crate::time::DEFAULT_NETWORK_DELAY_MS,
            resync_default_page_size: 100,
            instance_id: 0,
            deployment_id: 0,
            max_ttl_secs: 30,
            dns_servers: Vec::new(),
            http_bind_address: "0.0.0.0".into(),
            http_bind_port: 9999,
            http_threads: 4,
        }
    }
}

/// Builds a [`GlobalConfig`] from a `config::Config` source, validating
/// and applying defaults for every key in spec §6.3.
pub fn load(source: &config::Config) -> Result<GlobalConfig> {
    let get_string = |key: &str| -> Option<String> { source.get_string(key).ok() };
    let get_vec = |key: &str| -> Vec<String> {
        source
            .get_array(key)
            .map(|v| v.into_iter().filter_map(|i| i.into_string().ok()).collect())
            .unwrap_or_default()
    };

    let localhost = get_string("cluster.localhost")
        .ok_or_else(|| Error::Config("cluster.localhost is required".into()))?;
    let node = get_vec("cluster.node");
    let joining = get_vec("cluster.joining");
    let leaving = get_vec("cluster.leaving");

    let staying: Vec<String> = node
        .iter()
        .filter(|m| !leaving.contains(m))
        .cloned()
        .collect();
    let mut new_members = staying.clone();
    for m in &joining {
        if !new_members.contains(m) {
            new_members.push(m.clone());
        }
    }

    let replication_factor = source
        .get_int("cluster.replication-factor")
        .unwrap_or(2)
        .max(1) as u32;

    let id_format = match get_string("timers.id-format") {
        Some(s) => parse_id_format(&s)?,
        None => IdFormat::WithoutReplicas,
    };

    let remote_site_table = source
        .get_table("remote-site")
        .unwrap_or_default();
    let remote_sites = remote_site_table
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .into_string()
                .ok()
                .map(|endpoint| RemoteSite { name, endpoint })
        })
        .collect();

    Ok(GlobalConfig {
        cluster_view: ClusterView::new("v1".into(), new_members),
        joining,
        leaving,
        local_member: localhost,
        replication_factor,
        sites: get_vec("reliability.sites"),
        local_site: get_string("local-site-name").unwrap_or_default(),
        remote_sites,
        id_format,
        network_delay_ms: source
            .get_int("merge.network-delay-ms")
            .unwrap_or(crate::time::DEFAULT_NETWORK_DELAY_MS as i64) as u32,
        resync_default_page_size: source
            .get_int("resync.default-page-size")
            .unwrap_or(100)
            .max(1) as usize,
        instance_id: source.get_int("identity.instance_id").unwrap_or(0) as u8,
        deployment_id: source.get_int("identity.deployment_id").unwrap_or(0) as u8,
        max_ttl_secs: source.get_int("exceptions.max_ttl").unwrap_or(30) as u64,
        dns_servers: get_vec("dns.servers"),
        http_bind_address: get_string("http.bind-address").unwrap_or_else(|| "0.0.0.0".into()),
        http_bind_port: source.get_int("http.bind-port").unwrap_or(9999) as u16,
        http_threads: source.get_int("http.threads").unwrap_or(4).max(1) as usize,
    })
}

/// Thread-safe handle to the current [`GlobalConfig`], cloneable and
/// cheap to pass around. Readers call [`SharedConfig::snapshot`]; writers
/// call [`SharedConfig::update`] which takes the write lock for the
/// duration of the closure (spec §5 "setters take the writer lock around
/// batches of related updates").
#[derive(Clone)]
pub struct SharedConfig(Arc<RwLock<GlobalConfig>>);

impl SharedConfig {
    pub fn new(config: GlobalConfig) -> Self {
        SharedConfig(Arc::new(RwLock::new(config)))
    }

    pub fn snapshot(&self) -> GlobalConfig {
        self.0.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut GlobalConfig)) {
        let mut guard = self.0.write();
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_config_has_self_as_sole_member() {
        let cfg = GlobalConfig::standalone("node1:9999");
        assert_eq!(cfg.cluster_view.members, vec!["node1:9999".to_string()]);
        assert!(cfg.is_cluster_member("node1:9999"));
        assert!(!cfg.is_cluster_member("node2:9999"));
    }

    #[test]
    fn joining_and_leaving_count_as_cluster_members() {
        let mut cfg = GlobalConfig::standalone("node1:9999");
        cfg.joining.push("node2:9999".into());
        cfg.leaving.push("node3:9999".into());
        assert!(cfg.is_cluster_member("node2:9999"));
        assert!(cfg.is_cluster_member("node3:9999"));
    }

    #[test]
    fn shared_config_update_is_visible_to_later_snapshots() {
        let shared = SharedConfig::new(GlobalConfig::standalone("node1:9999"));
        shared.update(|cfg| cfg.replication_factor = 3);
        assert_eq!(shared.snapshot().replication_factor, 3);
    }
}
