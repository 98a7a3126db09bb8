//! Store ports and their adapters
//!
//! Jobs live in a durable store, fast-mutating counters in an ephemeral one.
//! Each side has its own port so that it can fail and be tested on its own.

use crate::error::StoreError;
use crate::model::{BotId, BotRecord, BotStatus, BroadcastJob, JobId, JobStatus, ProgressState, UserId};
use crate::reply::{GlobalReply, WorkerReply};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeSet;
use std::sync::Arc;

/// In-memory adapters for every port.
pub mod memory;
/// Object store (R2/S3) adapter for jobs, bots and replies.
pub mod r2;
/// Redis adapters for progress counters and the media cache.
pub mod redis;

/// Lazy, finite listing of a bot's subscribers.
pub type SubscriberStream = BoxStream<'static, Result<UserId, StoreError>>;

/// Durable record of broadcast jobs
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Returns `false` if the id is already taken.
    async fn insert(&self, job: &BroadcastJob) -> Result<bool, StoreError>;
    /// Load a job
    async fn get(&self, id: &JobId) -> Result<Option<BroadcastJob>, StoreError>;
    /// Update the status. Returns `false` if the job does not exist or is
    /// terminal and `status` would move it out of that status.
    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<bool, StoreError>;
    /// Record final counters. Returns `false` if the job does not exist.
    async fn set_final_counts(&self, id: &JobId, sent: u64, failed: u64)
        -> Result<bool, StoreError>;
    /// List jobs with the given status, oldest first
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<BroadcastJob>, StoreError>;
}

/// Ephemeral progress counters of running jobs
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Create zeroed counters with status `running`
    async fn init(&self, id: &JobId) -> Result<(), StoreError>;
    /// Atomically increment `sent`, returning the new value
    async fn incr_sent(&self, id: &JobId) -> Result<u64, StoreError>;
    /// Atomically increment `failed`, returning the new value
    async fn incr_failed(&self, id: &JobId) -> Result<u64, StoreError>;
    /// Record the position within the bot being processed
    async fn set_cursor(&self, id: &JobId, cursor: u64) -> Result<(), StoreError>;
    /// Read every counter. `None` if nothing is recorded for the job.
    async fn get_all(&self, id: &JobId) -> Result<Option<ProgressState>, StoreError>;
    /// Read the live status mirror
    async fn status(&self, id: &JobId) -> Result<Option<JobStatus>, StoreError>;
    /// Write the live status mirror
    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<(), StoreError>;
    /// Record that `worker` finished its share; returns every finished worker
    async fn mark_worker_done(&self, id: &JobId, worker: &str)
        -> Result<BTreeSet<String>, StoreError>;
    /// Whether `worker` already finished its share
    async fn is_worker_done(&self, id: &JobId, worker: &str) -> Result<bool, StoreError>;
    /// Drop every key of the job
    async fn delete(&self, id: &JobId) -> Result<(), StoreError>;
}

/// Registry of bots and their subscribers
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait BotRegistry: Send + Sync {
    /// Load a bot
    async fn get(&self, id: &BotId) -> Result<Option<BotRecord>, StoreError>;
    /// Bots assigned to `worker`
    async fn list_by_worker(&self, worker: &str) -> Result<Vec<BotRecord>, StoreError>;
    /// Number of subscribers; 0 for unknown bots
    async fn count_subscribers(&self, id: &BotId) -> Result<u64, StoreError>;
    /// Stream the subscribers in listing order
    async fn list_subscribers(&self, id: &BotId) -> Result<SubscriberStream, StoreError>;
    /// Record a health check result. Returns `false` for unknown bots.
    async fn set_status(&self, id: &BotId, status: BotStatus) -> Result<bool, StoreError>;
}

/// Global and worker-level auto replies
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait ReplyStore: Send + Sync {
    /// Fleet-wide reply
    async fn global_reply(&self) -> Result<Option<GlobalReply>, StoreError>;
    /// Reply shared by the bots of one worker
    async fn worker_reply(&self, worker: &str) -> Result<Option<WorkerReply>, StoreError>;
    /// Replace the fleet-wide reply
    async fn set_global_reply(&self, reply: &GlobalReply) -> Result<(), StoreError>;
    /// Replace a worker-level reply
    async fn set_worker_reply(&self, reply: &WorkerReply) -> Result<(), StoreError>;
}

/// The store handles shared by the lifecycle manager and the dispatch loop.
#[derive(Clone)]
pub struct Stores {
    /// Durable job records
    pub jobs: Arc<dyn JobStore>,
    /// Ephemeral counters
    pub progress: Arc<dyn ProgressStore>,
    /// Bots and subscribers
    pub registry: Arc<dyn BotRegistry>,
}

impl Stores {
    /// Bundle store handles
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        progress: Arc<dyn ProgressStore>,
        registry: Arc<dyn BotRegistry>,
    ) -> Self {
        Self {
            jobs,
            progress,
            registry,
        }
    }
}
