//! Collaborator interfaces (spec §2 "Collaborator interfaces", §4.5): the
//! trait surfaces the core hands timers across into subsystems this crate
//! treats as external (callback delivery, local/GR replication, the HTTP
//! transport layer). Grounded in the teacher's `#[async_trait]
//! CrossCrateEventHandler` pattern (`rvoip-dialog-core`'s `DialogEventHub`):
//! a thin async trait at the seam, with one concrete in-process
//! implementation shipped and a fake used in tests.

use async_trait::async_trait;

use crate::error::Result;
use crate::timer::{Timer, TimerId};
use crate::time::MonoMs;

/// What a callback attempt resolved to. The worker does not mutate or
/// return the timer — the handler already retains everything it needs
/// to reinsert or discard (spec §4.4 `return_timer`/`handle_*_callback`).
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    Succeeded,
    Failed(String),
}

/// Fires one HTTP callback and resolves to its outcome. Real
/// implementations own a worker pool of ~50 OS threads draining a shared
/// queue (spec §4.5); `fire` itself is the unit of work handed to that
/// pool, not the pool's submission API — the handler's tick thread calls
/// it inside a spawned task rather than blocking on it (see
/// `handler::TimerHandler::pop`).
#[async_trait]
pub trait CallbackWorker: Send + Sync {
    async fn fire(&self, timer: Timer) -> CallbackOutcome;
}

/// Replicates a timer to another member of the local cluster (spec §4.5
/// "Local replicator"). `target` is a `host:port` cluster member address.
#[async_trait]
pub trait LocalReplicator: Send + Sync {
    async fn replicate(&self, target: &str, timer: &Timer) -> Result<()>;
}

/// Replicates a timer to a remote site's endpoint for geographic
/// redundancy (spec §4.5 "GR replicator"). Callers are expected to have
/// already stripped `replicas` and removed the sending site from `sites`
/// before calling, per spec's "so the message doesn't bounce".
#[async_trait]
pub trait GrReplicator: Send + Sync {
    async fn replicate(&self, site_endpoint: &str, timer: &Timer) -> Result<()>;
}

/// One timer as returned from a resync GET, paired with the replica list
/// it carried on the serving node before that node recomputed it under
/// the requester's epoch (spec §4.4 `get_timers_for_node`, §4.6 step 2).
#[derive(Debug, Clone)]
pub struct ResyncEntry {
    pub timer: Timer,
    pub old_replicas: Vec<String>,
}

/// A page of a resync GET response (spec §4.4 step 4-5, §6.1).
#[derive(Debug, Clone)]
pub struct ResyncPage {
    pub entries: Vec<ResyncEntry>,
    /// True iff more timers remain beyond this page (HTTP 206 vs 200).
    pub more: bool,
}

/// Encodes the method/path/status table of spec §6.1 as an async trait so
/// an HTTP transport layer (explicit Non-goal of this crate) is a
/// mechanical adapter over `TimerHandler`, not a reimplementation of its
/// logic.
#[async_trait]
pub trait HttpRequestHandler: Send + Sync {
    /// POST `/timers` or `/timers/`: assigns a fresh id, returns it plus
    /// the canonical JSON the `Location` header should be built from.
    async fn create_timer(&self, body: Vec<u8>) -> Result<(TimerId, Vec<u8>)>;

    /// PUT `/timers/{id}{suffix}`.
    async fn put_timer(&self, id: TimerId, replication_factor_hint: u32, body: Vec<u8>) -> Result<()>;

    /// DELETE `/timers/{id}{suffix}`.
    async fn delete_timer(&self, id: TimerId) -> Result<()>;

    /// GET `/timers?node-for-replicas=...;cluster-view-id=...;time-from=...`,
    /// optionally capped by a `Range: N` header.
    async fn get_resync(
        &self,
        node_for_replicas: String,
        cluster_view_id: String,
        time_from: MonoMs,
        range: Option<usize>,
    ) -> Result<ResyncPage>;

    /// DELETE `/timers/references`: clears tracker bits named by
    /// `(id, replica_index)` pairs.
    async fn delete_references(&self, refs: Vec<(TimerId, u32)>) -> Result<()>;
}
