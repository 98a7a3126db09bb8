#![deny(missing_docs)]
//! Bot fleet broadcast runtime.
//!
//! Transport-agnostic dispatch loop, delivery and health checks run by each worker.

/// Local job claims.
pub mod claims;
/// Per-subscriber delivery with media reuse.
pub mod delivery;
/// Job scanning and per-worker dispatch.
pub mod dispatch;
/// Periodic bot health checks.
pub mod health;
/// Cached transport handles.
pub mod pool;

pub use delivery::Deliverer;
pub use dispatch::{DispatchConfig, DispatchError, DispatchLoop, JobOutcome};
pub use health::{HealthChecker, HealthReport};
pub use pool::TransportPool;
