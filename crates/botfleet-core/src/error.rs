//! Error types for the lifecycle manager and store adapters.

use thiserror::Error;

/// Errors surfaced by the exposed job operations.
#[derive(Error, Debug)]
pub enum BroadcastError {
    /// Input rejected before anything was written.
    #[error("Validation error: {0}")]
    Validation(String),
    /// Referenced job does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// A backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by durable and ephemeral store adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Durable (object store) I/O failed.
    #[error("Durable store error: {0}")]
    Durable(String),
    /// Ephemeral (Redis) I/O failed.
    #[error("Ephemeral store error: {0}")]
    Ephemeral(String),
    /// Stored document could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Adapter misconfigured.
    #[error("Configuration error: {0}")]
    Config(String),
}
