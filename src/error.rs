//! Crate-wide error type.
//!
//! Every fallible operation in `chronos-core` returns `Result<T>` built on
//! this enum, rather than bespoke per-module error types — mirroring how
//! the rest of the Chronos core is a single mutex-guarded subsystem rather
//! than a collection of loosely coupled services.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the timer entity, store, handler, placement and
/// resync subsystems. See spec §7 for the surfacing rules for each variant.
#[derive(Debug, Error)]
pub enum Error {
    /// The request body was not valid JSON at all.
    #[error("malformed JSON body: {0}")]
    MalformedJson(String),

    /// A required field was absent from an otherwise well-formed body.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// `interval_ms == 0` while `repeat_for_ms != 0`.
    #[error("invalid timing: interval is zero but repeat-for is {repeat_for_ms}ms")]
    InvalidTiming { repeat_for_ms: u64 },

    /// An explicit `reliability.replicas` array was empty or conflicted
    /// with the replication-factor hint supplied out of band.
    #[error("invalid replicas: {0}")]
    InvalidReplicas(String),

    /// `reliability.replication-factor` in the body disagreed with a
    /// non-zero hint supplied by the caller (e.g. from the URL suffix).
    #[error("replication factor mismatch: body says {body}, hint says {hint}")]
    ReplicaMismatch { body: u32, hint: u32 },

    /// A resync GET named a `cluster-view-id` that isn't the current one.
    #[error("cluster view mismatch: requested {requested}, current is {current}")]
    ClusterViewMismatch { requested: String, current: String },

    /// A resync GET named a node that isn't part of the current,
    /// joining, or leaving membership.
    #[error("node not in cluster: {0}")]
    NodeNotInCluster(String),

    /// A PUT/DELETE/point-lookup named an id the store has nothing on
    /// file for.
    #[error("no timer with id {0}")]
    TimerNotFound(u64),

    /// Outbound replication (local or GR) failed in transport. Recovered
    /// locally: logged, timer kept, resync will eventually heal.
    #[error("replication to {target} failed: {source}")]
    ReplicationSendFailed {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// The client callback returned a non-2xx status or a transport error.
    /// Recovered locally: timer discarded, counters decremented.
    #[error("callback for timer {timer_id} failed: {reason}")]
    CallbackFailed { timer_id: u64, reason: String },

    /// `TimerStore::remove` could not find the timer where the pop-time
    /// classification said it should be. Recovered locally via full sweep.
    #[error("store inconsistency for timer {timer_id}: not found in expected bucket")]
    StoreInconsistency { timer_id: u64 },

    /// The monotonic clock went backwards or became unavailable. Not
    /// locally recoverable — the caller is expected to abort the process.
    #[error("monotonic clock regression detected")]
    ClockRegression,

    /// Configuration parsing/validation failure (§6.3).
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for conditions that don't fit the table above but still
    /// need to carry a message (mirrors `infra_common::errors::Error::Custom`).
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// True for errors spec §7 says should be surfaced to an HTTP caller
    /// as 400 Bad Request, as opposed to ones that are locally recovered.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Error::MalformedJson(_)
                | Error::MissingField(_)
                | Error::InvalidTiming { .. }
                | Error::InvalidReplicas(_)
                | Error::ReplicaMismatch { .. }
                | Error::ClusterViewMismatch { .. }
                | Error::NodeNotInCluster(_)
        )
    }

    /// True for errors spec §6.1 surfaces as 404 Not Found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::TimerNotFound(_))
    }
}
