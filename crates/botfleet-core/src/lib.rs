#![deny(missing_docs)]
//! Bot fleet broadcast core library.
//!
//! Domain model, store ports and adapters, and the broadcast job lifecycle.

/// Credential encryption.
pub mod cipher;
/// Configuration management.
pub mod config;
/// Error types.
pub mod error;
/// Broadcast job lifecycle operations.
pub mod lifecycle;
/// Per-bot media reference cache.
pub mod media_cache;
/// Domain model.
pub mod model;
/// Process-wide send rate limiter.
pub mod rate_limit;
/// Auto replies and variable rendering.
pub mod reply;
/// Store ports and adapters (memory, R2, Redis).
pub mod store;
/// Messaging transport port.
pub mod transport;

/// Test fixtures and mock constructors.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
