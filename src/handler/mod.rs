//! The Timer Handler (spec §4.4, §4.7): the single mutex/condvar/tick-
//! thread dispatcher that owns the [`TimerStore`], applies the merge rule
//! to concurrent updates, drives the tick loop, and handles the
//! post-callback lifecycle.
//!
//! ```text
//!      ┌──────────── insert ────────────┐
//!      ▼                                │
//!   STORED ── tick ──▶ POPPED ── cb ok ──┤
//!      │                     │          │
//!      │                     │ cb fail  ▼
//!      │                     └────▶ DISCARDED (counters decremented)
//!      │
//!      │ DELETE / natural completion
//!      ▼
//!   TOMBSTONED (still in store, still ticks, silently dropped on pop)
//!      │
//!      ▼ (after interval_ms * (seq+1))
//!   REAPED
//! ```

pub mod merge;
pub mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::collab::{CallbackOutcome, CallbackWorker, GrReplicator, LocalReplicator, ResyncEntry, ResyncPage};
use crate::config::SharedConfig;
use crate::error::{Error, Result};
use crate::placement;
use crate::store::wheel::SHORT_WHEEL_RESOLUTION_MS;
use crate::store::{HealthSink, TimerStore};
use crate::time::{Clock, MonoMs};
use crate::timer::{Entry, Timer, TimerId};

/// The information-timer half retained alongside an in-flight timer,
/// carried through a callback round trip so it can be reattached on
/// reinsertion (spec §3.2).
type InfoHalf = (Timer, u32);

/// Message the callback worker's spawned task reports back with, per the
/// message-passing arrangement of spec §9 ("the callback worker sends
/// `{CallbackSucceeded(id) | CallbackFailed(id)}` back to the handler
/// over an MPSC channel; the handler thread processes these alongside
/// its tick loop").
enum CallbackCompletion {
    Succeeded(TimerId),
    Failed(TimerId, String),
}

struct Inner {
    store: TimerStore,
    /// Timers currently out for callback: popped from the store, not yet
    /// returned. Keyed by id so `handle_successful_callback` /
    /// `handle_failed_callback` can recover them from just an id.
    in_flight: HashMap<TimerId, (Timer, Option<InfoHalf>)>,
}

pub struct TimerHandler {
    inner: Mutex<Inner>,
    cond: Condvar,
    config: SharedConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<dyn stats::StatsSink>,
    callback_worker: Arc<dyn CallbackWorker>,
    local_replicator: Arc<dyn LocalReplicator>,
    gr_replicator: Arc<dyn GrReplicator>,
    runtime: Handle,
    callback_tx: mpsc::Sender<CallbackCompletion>,
    callback_rx: Mutex<mpsc::Receiver<CallbackCompletion>>,
    terminate: AtomicBool,
}

impl TimerHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SharedConfig,
        clock: Arc<dyn Clock>,
        health: Arc<dyn HealthSink>,
        stats: Arc<dyn stats::StatsSink>,
        callback_worker: Arc<dyn CallbackWorker>,
        local_replicator: Arc<dyn LocalReplicator>,
        gr_replicator: Arc<dyn GrReplicator>,
        runtime: Handle,
    ) -> Self {
        let (callback_tx, callback_rx) = mpsc::channel();
        let tick_timestamp = clock.now_ms();
        TimerHandler {
            inner: Mutex::new(Inner {
                store: TimerStore::with_health(tick_timestamp, health),
                in_flight: HashMap::new(),
            }),
            cond: Condvar::new(),
            config,
            clock,
            stats,
            callback_worker,
            local_replicator,
            gr_replicator,
            runtime,
            callback_tx,
            callback_rx: Mutex::new(callback_rx),
            terminate: AtomicBool::new(false),
        }
    }

    /// `add_timer` (spec §4.4): merges `incoming` against whatever is
    /// currently stored for its id and inserts the winner.
    pub fn add_timer(&self, incoming: Timer) -> Result<()> {
        self.merge_and_store(incoming, false, None)
    }

    /// Point lookup of the current active timer for `id`, without
    /// removing it. Used by HTTP GET-by-id layers and by tests.
    pub fn peek(&self, id: TimerId) -> Option<Timer> {
        let inner = self.inner.lock();
        inner.store.peek(id).map(|e| e.active().clone())
    }

    /// DELETE semantics (spec §6.1, §3.4 step 5): tombstones the timer in
    /// place, carrying over `interval_ms`/`repeat_for_ms` so the
    /// tombstone outlives any in-flight copy of the original. The
    /// tombstone's `start_time_mono_ms` is bumped to "now" rather than
    /// kept from the deleted timer — a DELETE is itself a fresh write,
    /// and must win the same-sequence-number merge race (spec §4.4 step
    /// 3) against a delayed resubmission of the original create.
    pub fn delete_timer(&self, id: TimerId) -> Result<()> {
        let existing = {
            let inner = self.inner.lock();
            inner.store.peek(id).map(|e| e.active().clone())
        };
        let mut tombstone = existing.ok_or(Error::TimerNotFound(id))?;
        tombstone.become_tombstone();
        tombstone.start_time_mono_ms = self.clock.now_ms();
        self.add_timer(tombstone)
    }

    /// The shared implementation behind `add_timer` and the reinsertion
    /// half of `return_timer`/`handle_successful_callback`. `carry_info`
    /// lets a caller that already popped an entry's information half
    /// reattach it on reinsertion even though the store no longer has
    /// anything on file for this id.
    fn merge_and_store(&self, incoming: Timer, suppress_stats: bool, carry_info: Option<InfoHalf>) -> Result<()> {
        let cfg = self.config.snapshot();
        let mut inner = self.inner.lock();

        let existing_entry = inner.store.fetch(incoming.id);
        let (existing_active, existing_info) = match existing_entry {
            Some(Entry::Active(t)) => (Some(t), None),
            Some(Entry::Transitioning { active, old, tracker }) => (Some(active), Some((old, tracker))),
            None => (None, None),
        };

        let mut winner = match &existing_active {
            Some(existing) => match merge::resolve(&incoming, existing, &cfg.cluster_view.view_id, cfg.network_delay_ms) {
                merge::Winner::New => incoming,
                merge::Winner::Existing => existing.clone(),
            },
            None => incoming,
        };

        let is_new_winner = existing_active.as_ref() != Some(&winner);
        if is_new_winner && winner.is_tombstone() {
            if let Some(existing) = &existing_active {
                winner.interval_ms = existing.interval_ms;
                winner.repeat_for_ms = existing.repeat_for_ms;
            }
        }

        let existing_sites: &[String] = existing_active
            .as_ref()
            .map(|t| t.sites.as_slice())
            .unwrap_or(&winner.sites);
        winner.sites = placement::merge_site_order(existing_sites, &cfg.sites);

        if !suppress_stats {
            let (adds, removes) = stats::tag_deltas(
                &winner.tags,
                existing_active.as_ref().map(|t| &t.tags).unwrap_or(&Default::default()),
            );
            stats::apply_tag_deltas(self.stats.as_ref(), &adds, &removes);

            match &existing_active {
                None if !winner.is_tombstone() => self.stats.increment("__total", 1),
                Some(existing) if !existing.is_tombstone() && winner.is_tombstone() => {
                    self.stats.decrement("__total", 1)
                }
                _ => {}
            }
        }

        let info = carry_info.or(existing_info);
        let next_pop_time = winner.next_pop_time(&cfg.local_member);
        let entry = match info {
            Some((old, tracker)) => Entry::Transitioning { active: winner, old, tracker },
            None => Entry::Active(winner),
        };
        inner.store.insert(entry, next_pop_time);
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// `return_timer` (spec §4.4, §3.4 step 4): invoked by the callback
    /// worker's completion path after a successful HTTP callback.
    fn return_timer(&self, mut t: Timer, info: Option<InfoHalf>) {
        if t.exhausted() {
            for (tag, count) in t.tags.iter() {
                self.stats.decrement(tag, *count);
            }
            self.stats.decrement("__total", 1);
            t.become_tombstone();
        }
        if let Err(err) = self.merge_and_store(t, true, info) {
            warn!(error = %err, "failed to reinsert returned timer");
        }
    }

    /// `handle_successful_callback` (spec §4.4): cross-site and local
    /// replication, then reinsertion via `return_timer`.
    fn handle_successful_callback(&self, id: TimerId) {
        let (active, info) = {
            let mut inner = self.inner.lock();
            match inner.in_flight.remove(&id) {
                Some(v) => v,
                None => {
                    warn!(timer_id = id, "successful callback for unknown in-flight timer");
                    return;
                }
            }
        };

        let cfg = self.config.snapshot();
        for site in active.sites.iter().skip(1) {
            if let Some(endpoint) = cfg.remote_site_endpoint(site) {
                let mut remote = active.clone();
                remote.replicas.clear();
                remote.sites.retain(|s| s != &cfg.local_site);
                if let Err(err) = self.runtime.block_on(self.gr_replicator.replicate(endpoint, &remote)) {
                    warn!(site, error = %err, "GR replication failed");
                }
            }
        }
        for replica in active.replicas.iter() {
            if replica != &cfg.local_member {
                if let Err(err) = self.runtime.block_on(self.local_replicator.replicate(replica, &active)) {
                    warn!(replica, error = %err, "local replication failed");
                }
            }
        }

        self.return_timer(active, info);
    }

    /// `handle_failed_callback` (spec §4.4): discard, decrement counters.
    fn handle_failed_callback(&self, id: TimerId, reason: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            inner.in_flight.remove(&id)
        };
        let Some((active, _info)) = removed else {
            warn!(timer_id = id, "failed callback for unknown in-flight timer");
            return;
        };
        warn!(timer_id = id, reason, "callback failed, discarding timer");
        for (tag, count) in active.tags.iter() {
            self.stats.decrement(tag, *count);
        }
        self.stats.decrement("__total", 1);
    }

    /// `pop` (spec §4.4 "Tick loop"): tombstones are discarded silently;
    /// otherwise the sequence number and placement are advanced and the
    /// timer is handed to the callback worker via a spawned task, freeing
    /// the tick thread to keep advancing the wheel.
    fn pop(self: &Arc<Self>, entry: Entry) {
        let (mut active, info) = match entry {
            Entry::Active(t) => (t, None),
            Entry::Transitioning { active, old, tracker } => (active, Some((old, tracker))),
        };

        if active.is_tombstone() {
            return;
        }

        let cfg = self.config.snapshot();
        active.sequence_number = active.sequence_number.saturating_add(1);
        active.replicas = placement::choose_replicas(active.id, &cfg.cluster_view, active.replication_factor);
        active.cluster_view_id = cfg.cluster_view.view_id.clone();

        let id = active.id;
        {
            let mut inner = self.inner.lock();
            inner.in_flight.insert(id, (active.clone(), info));
        }

        let worker = Arc::clone(&self.callback_worker);
        let tx = self.callback_tx.clone();
        self.runtime.spawn(async move {
            let outcome = worker.fire(active).await;
            let msg = match outcome {
                CallbackOutcome::Succeeded => CallbackCompletion::Succeeded(id),
                CallbackOutcome::Failed(reason) => CallbackCompletion::Failed(id, reason),
            };
            let _ = tx.send(msg);
        });
    }

    fn drain_callback_completions(&self) {
        let completions: Vec<CallbackCompletion> = {
            let rx = self.callback_rx.lock();
            rx.try_iter().collect()
        };
        for completion in completions {
            match completion {
                CallbackCompletion::Succeeded(id) => self.handle_successful_callback(id),
                CallbackCompletion::Failed(id, reason) => self.handle_failed_callback(id, &reason),
            }
        }
    }

    /// `get_timers_for_node` (spec §4.4): resync RPC served to peers.
    pub fn get_timers_for_node(
        &self,
        request_node: &str,
        max: usize,
        cluster_view_id: &str,
        time_from: MonoMs,
    ) -> Result<ResyncPage> {
        let cfg = self.config.snapshot();
        if cluster_view_id != cfg.cluster_view.view_id {
            return Err(Error::ClusterViewMismatch {
                requested: cluster_view_id.to_string(),
                current: cfg.cluster_view.view_id.clone(),
            });
        }
        if !cfg.is_cluster_member(request_node) {
            return Err(Error::NodeNotInCluster(request_node.to_string()));
        }

        let inner = self.inner.lock();
        let candidates = inner.store.iter_from(time_from);

        let mut entries = Vec::new();
        let mut last_pop_time: Option<MonoMs> = None;
        let mut more = false;

        for candidate in candidates {
            let old_replicas = candidate.active().replicas.clone();
            let mut timer = candidate.active().clone();
            let pop_time = timer.next_pop_time(&cfg.local_member);

            if entries.len() >= max {
                if last_pop_time != Some(pop_time) {
                    more = true;
                    break;
                }
            }

            timer.replicas = placement::choose_replicas(timer.id, &cfg.cluster_view, timer.replication_factor);
            timer.cluster_view_id = cfg.cluster_view.view_id.clone();

            if timer.replicas.iter().any(|r| r == request_node) {
                entries.push(ResyncEntry { timer, old_replicas });
                last_pop_time = Some(pop_time);
            }
        }

        Ok(ResyncPage { entries, more })
    }

    /// The tick loop (spec §4.4 "Tick loop"). Runs until [`TimerHandler::terminate`]
    /// is called; meant to be driven from its own dedicated OS thread.
    pub fn run(self: &Arc<Self>) {
        info!("timer handler tick loop starting");
        loop {
            if self.terminate.load(Ordering::Acquire) {
                break;
            }

            let now = self.clock.now_ms();
            let batch = {
                let mut inner = self.inner.lock();
                inner.store.fetch_next_timers(now)
            };

            if !batch.is_empty() {
                for entry in batch {
                    self.pop(entry);
                }
            } else {
                let mut inner = self.inner.lock();
                self.cond
                    .wait_for(&mut inner, Duration::from_millis(SHORT_WHEEL_RESOLUTION_MS as u64));
            }

            self.drain_callback_completions();
        }
        info!("timer handler tick loop stopped");
    }

    /// Signals the tick loop to exit after its current iteration.
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::store::NullHealthSink;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct NoopCallbackWorker;
    #[async_trait]
    impl CallbackWorker for NoopCallbackWorker {
        async fn fire(&self, _timer: Timer) -> CallbackOutcome {
            CallbackOutcome::Succeeded
        }
    }

    struct NoopReplicator;
    #[async_trait]
    impl LocalReplicator for NoopReplicator {
        async fn replicate(&self, _target: &str, _timer: &Timer) -> Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl GrReplicator for NoopReplicator {
        async fn replicate(&self, _site_endpoint: &str, _timer: &Timer) -> Result<()> {
            Ok(())
        }
    }

    struct FixedClock(std::sync::atomic::AtomicU32);
    impl Clock for FixedClock {
        fn now_ms(&self) -> MonoMs {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn test_timer(id: TimerId) -> Timer {
        Timer {
            id,
            start_time_mono_ms: 0,
            interval_ms: 1000,
            repeat_for_ms: 1000,
            sequence_number: 0,
            cluster_view_id: "v0".into(),
            replicas: vec!["node1:9999".into()],
            extra_replicas: vec![],
            sites: vec![],
            tags: BTreeMap::new(),
            callback_url: "http://example.com/cb".into(),
            callback_body: "opaque".into(),
            replication_factor: 1,
            replica_tracker: 0,
        }
    }

    fn test_handler(rt: &tokio::runtime::Runtime) -> Arc<TimerHandler> {
        let config = SharedConfig::new(GlobalConfig::standalone("node1:9999"));
        Arc::new(TimerHandler::new(
            config,
            Arc::new(FixedClock(std::sync::atomic::AtomicU32::new(0))),
            Arc::new(NullHealthSink),
            Arc::new(stats::NullStatsSink),
            Arc::new(NoopCallbackWorker),
            Arc::new(NoopReplicator),
            Arc::new(NoopReplicator),
            rt.handle().clone(),
        ))
    }

    #[test]
    fn add_timer_new_wins_when_no_existing() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let handler = test_handler(&rt);
        handler.add_timer(test_timer(1)).unwrap();
        let inner = handler.inner.lock();
        assert!(inner.store.contains(1));
    }

    #[test]
    fn merge_rule_is_applied_on_reinsert() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let handler = test_handler(&rt);
        handler.add_timer(test_timer(1)).unwrap();
        let mut second = test_timer(1);
        second.sequence_number = 1;
        second.start_time_mono_ms = 500;
        handler.add_timer(second).unwrap();
        let inner = handler.inner.lock();
        let stored = inner.store.peek(1).unwrap().active();
        assert_eq!(stored.sequence_number, 1);
    }

    #[test]
    fn get_timers_for_node_rejects_stale_cluster_view() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let handler = test_handler(&rt);
        let err = handler
            .get_timers_for_node("node1:9999", 10, "not-the-current-view", 0)
            .unwrap_err();
        assert!(matches!(err, Error::ClusterViewMismatch { .. }));
    }

    #[test]
    fn get_timers_for_node_rejects_unknown_node() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let handler = test_handler(&rt);
        let err = handler
            .get_timers_for_node("ghost:1", 10, "v0", 0)
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotInCluster(_)));
    }

    #[test]
    fn get_timers_for_node_returns_timers_replicated_to_requester() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let handler = test_handler(&rt);
        handler.add_timer(test_timer(1)).unwrap();
        let page = handler.get_timers_for_node("node1:9999", 10, "v0", 0).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(!page.more);
    }
}
