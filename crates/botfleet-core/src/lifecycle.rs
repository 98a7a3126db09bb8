//! Broadcast job lifecycle
//!
//! Creates jobs and moves them between `running`, `paused` and `completed`.
//! Status changes are written to the ephemeral store first, because dispatch
//! tasks read the live status from there, and then to the durable record.

use crate::error::{BroadcastError, StoreError};
use crate::model::{BotId, BroadcastJob, JobId, JobStatus, MessageContent};
use crate::store::Stores;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Whether a lifecycle operation changed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The job moved to the requested status
    Applied,
    /// The job already had that status, or is terminal
    Unchanged,
}

/// Progress report of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStats {
    /// Job id
    pub job_id: JobId,
    /// Live status, falling back to the durable one
    pub status: JobStatus,
    /// Position within the bot being processed
    pub cursor: u64,
    /// Successful deliveries
    pub sent: u64,
    /// Failed deliveries
    pub failed: u64,
    /// Subscriber total at creation time
    pub total: u64,
    /// Target bots
    pub target_bot_ids: Vec<BotId>,
}

/// Exposed job operations
pub struct JobManager {
    stores: Stores,
}

impl JobManager {
    /// Create a manager over the given stores
    #[must_use]
    pub const fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Create a running broadcast job.
    ///
    /// Duplicate target ids are dropped, keeping the first occurrence.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError::Validation` for an empty target list or
    /// invalid content, and `BroadcastError::Store` if a store fails.
    pub async fn create_job(
        &self,
        target_bot_ids: Vec<BotId>,
        content: MessageContent,
    ) -> Result<JobId, BroadcastError> {
        if target_bot_ids.is_empty() {
            return Err(BroadcastError::Validation(
                "at least one target bot is required".into(),
            ));
        }
        content.validate()?;

        let mut seen = BTreeSet::new();
        let targets: Vec<BotId> = target_bot_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let mut total = 0u64;
        let mut workers = BTreeSet::new();
        for bot_id in &targets {
            total += self.stores.registry.count_subscribers(bot_id).await?;
            match self.stores.registry.get(bot_id).await? {
                Some(bot) => workers.extend(bot.assigned_worker),
                None => warn!(bot_id = %bot_id, "Target bot is not registered"),
            }
        }

        let job = BroadcastJob::new(targets, content, total, workers);

        // Counters first: a job is only discoverable once its durable record exists.
        self.stores.progress.init(&job.id).await?;
        match self.stores.jobs.insert(&job).await {
            Ok(true) => {}
            Ok(false) => {
                self.discard_progress(&job.id).await;
                return Err(StoreError::Durable(format!("job id {} already exists", job.id)).into());
            }
            Err(e) => {
                self.discard_progress(&job.id).await;
                return Err(e.into());
            }
        }

        info!(
            job_id = %job.id,
            bots = job.target_bot_ids.len(),
            total = job.total,
            workers = ?job.workers,
            "Broadcast job created"
        );
        Ok(job.id)
    }

    async fn discard_progress(&self, id: &JobId) {
        if let Err(e) = self.stores.progress.delete(id).await {
            warn!(job_id = %id, error = %e, "Failed to discard progress of unsaved job");
        }
    }

    /// Put the durable status back into the live mirror after a refused change.
    async fn restore_mirror(&self, id: &JobId) -> Result<(), BroadcastError> {
        let job = self.require(id).await?;
        warn!(
            job_id = %id,
            status = %job.status,
            "Job changed status concurrently, keeping the stored status"
        );
        self.stores.progress.set_status(id, job.status).await?;
        Ok(())
    }

    async fn require(&self, id: &JobId) -> Result<BroadcastJob, BroadcastError> {
        self.stores
            .jobs
            .get(id)
            .await?
            .ok_or_else(|| BroadcastError::NotFound(format!("job {id}")))
    }

    /// Pause a running job.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError::NotFound` for unknown jobs.
    pub async fn pause(&self, id: &JobId) -> Result<Transition, BroadcastError> {
        self.move_to(id, JobStatus::Running, JobStatus::Paused).await
    }

    /// Resume a paused job.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError::NotFound` for unknown jobs.
    pub async fn resume(&self, id: &JobId) -> Result<Transition, BroadcastError> {
        self.move_to(id, JobStatus::Paused, JobStatus::Running).await
    }

    async fn move_to(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<Transition, BroadcastError> {
        let job = self.require(id).await?;

        if job.status == to {
            // Repair a live mirror left behind by an earlier partial write.
            self.stores.progress.set_status(id, to).await?;
            return Ok(Transition::Unchanged);
        }
        if job.status != from {
            return Ok(Transition::Unchanged);
        }

        self.stores.progress.set_status(id, to).await?;
        if !self.stores.jobs.set_status(id, to).await? {
            self.restore_mirror(id).await?;
            return Ok(Transition::Unchanged);
        }
        info!(job_id = %id, from = %from, to = %to, "Broadcast job status changed");
        Ok(Transition::Applied)
    }

    /// Stop a job for good. The job becomes `completed` with its current counters.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError::NotFound` for unknown jobs.
    pub async fn cancel(&self, id: &JobId) -> Result<Transition, BroadcastError> {
        let job = self.require(id).await?;
        if job.status.is_terminal() {
            return Ok(Transition::Unchanged);
        }

        let snapshot = self.stores.progress.get_all(id).await?.unwrap_or_default();
        self.stores
            .progress
            .set_status(id, JobStatus::Completed)
            .await?;
        if !self
            .stores
            .jobs
            .set_status(id, JobStatus::Completed)
            .await?
        {
            self.restore_mirror(id).await?;
            return Ok(Transition::Unchanged);
        }
        self.stores
            .jobs
            .set_final_counts(id, snapshot.sent, snapshot.failed)
            .await?;

        info!(
            job_id = %id,
            sent = snapshot.sent,
            failed = snapshot.failed,
            "Broadcast job cancelled"
        );
        Ok(Transition::Applied)
    }

    /// Report the progress of a job.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError::NotFound` for unknown jobs.
    pub async fn get_stats(&self, id: &JobId) -> Result<JobStats, BroadcastError> {
        let job = self.require(id).await?;
        let progress = self.stores.progress.get_all(id).await?;

        let (cursor, sent, failed, live_status) = match progress {
            Some(state) => (state.cursor, state.sent, state.failed, state.status),
            None if job.status.is_terminal() => (0, job.sent, job.failed, None),
            None => (0, 0, 0, None),
        };

        Ok(JobStats {
            job_id: job.id,
            status: live_status.unwrap_or(job.status),
            cursor,
            sent,
            failed,
            total: job.total,
            target_bot_ids: job.target_bot_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BotRecord;
    use crate::store::memory::{MemoryBotRegistry, MemoryJobStore, MemoryProgressStore};
    use crate::store::{JobStore, MockJobStore, MockProgressStore, ProgressStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixture {
        manager: JobManager,
        jobs: Arc<MemoryJobStore>,
        progress: Arc<MemoryProgressStore>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(MemoryBotRegistry::new());
        registry.insert_bot(BotRecord::new("a", "c", Some("w1"))).await;
        registry.insert_bot(BotRecord::new("b", "c", Some("w2"))).await;
        registry.add_subscribers(&BotId::from("a"), [1, 2, 3]).await;
        registry.add_subscribers(&BotId::from("b"), [4, 5]).await;

        let jobs = Arc::new(MemoryJobStore::new());
        let progress = Arc::new(MemoryProgressStore::new());
        let manager = JobManager::new(Stores::new(jobs.clone(), progress.clone(), registry));
        Fixture {
            manager,
            jobs,
            progress,
        }
    }

    fn targets(ids: &[&str]) -> Vec<BotId> {
        ids.iter().copied().map(BotId::from).collect()
    }

    #[tokio::test]
    async fn test_create_job_sums_subscribers_and_owners() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let id = f
            .manager
            .create_job(targets(&["a", "b", "ghost", "a"]), MessageContent::text("hi"))
            .await?;

        let job = f.jobs.get(&id).await?.ok_or_else(|| BroadcastError::NotFound(id.to_string()))?;
        assert_eq!(job.total, 5);
        assert_eq!(job.target_bot_ids, targets(&["a", "b", "ghost"]));
        assert_eq!(job.workers.iter().collect::<Vec<_>>(), ["w1", "w2"]);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        let stats = f.manager.get_stats(&id).await?;
        assert_eq!((stats.sent, stats.failed, stats.total), (0, 0, 5));
        assert_eq!(stats.status, JobStatus::Running);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_targets_create_nothing() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let result = f.manager.create_job(Vec::new(), MessageContent::text("hi")).await;
        assert!(matches!(result, Err(BroadcastError::Validation(_))));
        assert!(f.jobs.list_by_status(JobStatus::Running).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_content_creates_nothing() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let mut content = MessageContent::text("x");
        content.kind = crate::model::ContentKind::Photo;
        let result = f.manager.create_job(targets(&["a"]), content).await;
        assert!(matches!(result, Err(BroadcastError::Validation(_))));
        assert!(f.jobs.list_by_status(JobStatus::Running).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip_keeps_counters() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let id = f.manager.create_job(targets(&["a"]), MessageContent::text("hi")).await?;
        f.progress.incr_sent(&id).await?;

        assert_eq!(f.manager.pause(&id).await?, Transition::Applied);
        assert_eq!(f.manager.pause(&id).await?, Transition::Unchanged);
        assert_eq!(f.progress.status(&id).await?, Some(JobStatus::Paused));

        assert_eq!(f.manager.resume(&id).await?, Transition::Applied);
        assert_eq!(f.manager.resume(&id).await?, Transition::Unchanged);

        let stats = f.manager.get_stats(&id).await?;
        assert_eq!(stats.status, JobStatus::Running);
        assert_eq!(stats.sent, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_terminal() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let id = f.manager.create_job(targets(&["a"]), MessageContent::text("hi")).await?;
        f.progress.incr_sent(&id).await?;
        f.progress.incr_failed(&id).await?;

        assert_eq!(f.manager.cancel(&id).await?, Transition::Applied);
        assert_eq!(f.manager.cancel(&id).await?, Transition::Unchanged);
        assert_eq!(f.manager.resume(&id).await?, Transition::Unchanged);
        assert_eq!(f.manager.pause(&id).await?, Transition::Unchanged);

        let job = f.jobs.get(&id).await?.ok_or_else(|| BroadcastError::NotFound(id.to_string()))?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.sent, job.failed), (1, 1));
        assert!(job.completed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_of_expired_terminal_job_use_final_counts() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let id = f.manager.create_job(targets(&["a"]), MessageContent::text("hi")).await?;
        for _ in 0..3 {
            f.progress.incr_sent(&id).await?;
        }
        f.manager.cancel(&id).await?;
        f.progress.delete(&id).await?;

        let stats = f.manager.get_stats(&id).await?;
        assert_eq!(stats.status, JobStatus::Completed);
        assert_eq!(stats.sent, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let f = fixture().await;
        let missing = JobId::from("missing");
        assert!(matches!(f.manager.pause(&missing).await, Err(BroadcastError::NotFound(_))));
        assert!(matches!(f.manager.cancel(&missing).await, Err(BroadcastError::NotFound(_))));
        assert!(matches!(f.manager.get_stats(&missing).await, Err(BroadcastError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_durable_failure_discards_counters() {
        let registry = Arc::new(MemoryBotRegistry::new());
        let mut progress = MockProgressStore::new();
        progress.expect_init().times(1).returning(|_| Ok(()));
        progress.expect_delete().times(1).returning(|_| Ok(()));
        let mut jobs = MockJobStore::new();
        jobs.expect_insert()
            .returning(|_| Err(StoreError::Durable("bucket unavailable".into())));

        let manager = JobManager::new(Stores::new(
            Arc::new(jobs),
            Arc::new(progress),
            registry,
        ));
        let result = manager
            .create_job(targets(&["a"]), MessageContent::text("hi"))
            .await;
        assert!(matches!(result, Err(BroadcastError::Store(StoreError::Durable(_)))));
    }

    #[tokio::test]
    async fn test_stats_of_running_job_without_progress_are_zeroed() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let id = f.manager.create_job(targets(&["a"]), MessageContent::text("hi")).await?;
        f.progress.incr_sent(&id).await?;
        f.progress.delete(&id).await?;

        let stats = f.manager.get_stats(&id).await?;
        assert_eq!((stats.cursor, stats.sent, stats.failed), (0, 0, 0));
        assert_eq!(stats.status, JobStatus::Running);
        assert_eq!(stats.total, 3);
        Ok(())
    }

    /// Durable store where the job completes between the lifecycle read and its write.
    fn completing_job_store(job: BroadcastJob) -> MockJobStore {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut jobs = MockJobStore::new();
        jobs.expect_get().returning(move |_| {
            let mut job = job.clone();
            if reads.fetch_add(1, Ordering::SeqCst) > 0 {
                job.apply_status(JobStatus::Completed);
            }
            Ok(Some(job))
        });
        jobs.expect_set_status()
            .returning(|_, status| Ok(status == JobStatus::Completed));
        jobs
    }

    #[tokio::test]
    async fn test_pause_racing_completion_leaves_job_completed() -> Result<(), BroadcastError> {
        let job = BroadcastJob::new(targets(&["a"]), MessageContent::text("hi"), 3, BTreeSet::new());
        let id = job.id.clone();
        let progress = Arc::new(MemoryProgressStore::new());
        progress.init(&id).await?;

        let manager = JobManager::new(Stores::new(
            Arc::new(completing_job_store(job)),
            progress.clone(),
            Arc::new(MemoryBotRegistry::new()),
        ));

        assert_eq!(manager.pause(&id).await?, Transition::Unchanged);
        assert_eq!(progress.status(&id).await?, Some(JobStatus::Completed));
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_of_completed_job_is_unchanged() -> Result<(), BroadcastError> {
        let f = fixture().await;
        let id = f.manager.create_job(targets(&["a"]), MessageContent::text("hi")).await?;
        f.jobs.set_status(&id, JobStatus::Completed).await?;

        assert_eq!(f.manager.pause(&id).await?, Transition::Unchanged);
        assert_eq!(f.manager.resume(&id).await?, Transition::Unchanged);
        let job = f.jobs.get(&id).await?.ok_or_else(|| BroadcastError::NotFound(id.to_string()))?;
        assert_eq!(job.status, JobStatus::Completed);
        Ok(())
    }
}
