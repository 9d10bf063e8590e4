//! Structured logging setup, grounded in the teacher's
//! `infra_common::logging::setup`: an `EnvFilter`-driven `tracing`
//! subscriber, initialised once at process start. The core itself never
//! prints directly — every point spec §7 calls "logged" (replication
//! failures, store inconsistency, callback failures) is a `tracing`
//! event instead.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialises the global `tracing` subscriber from `CHRONOS_LOG`,
/// falling back to `info` if unset or unparsable. Safe to call more than
/// once; later calls are no-ops (mirrors `tracing_subscriber`'s own
/// idempotent `try_init`).
pub fn setup_logging() {
    let filter = EnvFilter::try_from_env("CHRONOS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
