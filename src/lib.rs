//! `chronos-core`: the store, handler, placement and resync engine for a
//! distributed, horizontally-scalable HTTP timer service.
//!
//! ```text
//!   collab::HttpRequestHandler (out of scope binary)
//!              │
//!              ▼
//!      handler::TimerHandler ──owns──▶ store::TimerStore
//!              │          │                  ▲
//!              │          └─ placement ───────┘
//!              ▼
//!   collab::{CallbackWorker, LocalReplicator, GrReplicator}
//! ```
//!
//! Out of scope (spec §1): HTTP transport, the callback/replicator
//! worker pools themselves, configuration *file* parsing, and process
//! supervision — this crate specifies and tests the core three
//! subsystems (store, handler, placement/resync) plus the trait seams
//! where the rest of a deployment plugs in.

pub mod collab;
pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod placement;
pub mod resync;
pub mod store;
pub mod time;
pub mod timer;

pub use error::{Error, Result};
pub use handler::TimerHandler;
pub use timer::{Entry, Timer, TimerId};
