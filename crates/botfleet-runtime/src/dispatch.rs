//! Broadcast dispatch loop
//!
//! Every worker scans the durable store for running jobs and dispatches the
//! share of each job it owns: the target bots assigned to it. Workers never
//! talk to each other; the job completes once every owning worker has
//! recorded its share as finished.

use crate::claims::ClaimSet;
use crate::delivery::Deliverer;
use crate::pool::TransportPool;
use botfleet_core::config::Settings;
use botfleet_core::error::StoreError;
use botfleet_core::model::{BotId, BotRecord, BroadcastJob, JobId, JobStatus};
use botfleet_core::rate_limit::RateLimiter;
use botfleet_core::store::Stores;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Errors that end a dispatch task
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Loading the job, reading its status or listing subscribers failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a dispatch task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job record no longer exists
    Missing,
    /// No target bot is assigned to this worker
    NotOwned,
    /// The job left `running`
    Interrupted(JobStatus),
    /// The worker is shutting down
    ShutDown,
    /// This worker is done; the listed workers are not
    ShareFinished {
        /// Owning workers that have not finished yet
        pending: Vec<String>,
    },
    /// Every owning worker is done and the job is completed
    Completed {
        /// Final sent count
        sent: u64,
        /// Final failed count
        failed: u64,
    },
}

/// Dispatch loop settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Name of this worker
    pub worker: String,
    /// Time between scans
    pub scan_interval: Duration,
}

impl DispatchConfig {
    /// Take the worker name and scan interval from `settings`
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            worker: settings.worker_name.clone(),
            scan_interval: settings.scan_interval(),
        }
    }
}

/// Scans for running jobs and dispatches this worker's share of each
pub struct DispatchLoop {
    config: DispatchConfig,
    stores: Stores,
    transports: Arc<TransportPool>,
    deliverer: Deliverer,
    limiter: Arc<RateLimiter>,
    claims: Arc<ClaimSet>,
    /// Bots fully dispatched per job; a resumed share skips them
    finished_bots: Mutex<HashMap<JobId, HashSet<BotId>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl DispatchLoop {
    /// Create a dispatch loop
    #[must_use]
    pub fn new(
        config: DispatchConfig,
        stores: Stores,
        transports: Arc<TransportPool>,
        deliverer: Deliverer,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config,
            stores,
            transports,
            deliverer,
            limiter,
            claims: Arc::new(ClaimSet::new()),
            finished_bots: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the loop and its dispatch tasks when cancelled
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Scan until shut down, then wait for in-flight dispatch tasks
    pub async fn run(self: Arc<Self>) {
        info!(
            worker = %self.config.worker,
            interval = ?self.config.scan_interval,
            "Dispatch loop started"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!(worker = %self.config.worker, error = %e, "Scan for running jobs failed");
            }
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!(worker = %self.config.worker, "Dispatch loop stopped");
    }

    /// Claim every running job this worker has not finished and spawn a task for it.
    ///
    /// Returns the ids of the spawned jobs.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Store` if running jobs cannot be listed.
    pub async fn scan_once(self: &Arc<Self>) -> Result<Vec<JobId>, DispatchError> {
        let running = self.stores.jobs.list_by_status(JobStatus::Running).await?;
        self.prune_finished_bots(&running).await;
        let listed = running.len();
        let mut spawned = Vec::new();

        for job in running {
            match self
                .stores
                .progress
                .is_worker_done(&job.id, &self.config.worker)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Cannot tell whether share is done, skipping");
                    continue;
                }
            }

            let Some(claim) = self.claims.try_claim(&job.id) else {
                continue;
            };

            let this = Arc::clone(self);
            self.tasks.spawn(async move {
                this.run_job(claim.job_id()).await;
                drop(claim);
            });
            spawned.push(job.id);
        }

        debug!(
            worker = %self.config.worker,
            running = listed,
            spawned = spawned.len(),
            claimed = self.claims.len(),
            "Scan finished"
        );
        Ok(spawned)
    }

    /// Drop remembered bots of jobs that reached a terminal status or vanished
    async fn prune_finished_bots(&self, running: &[BroadcastJob]) {
        let idle: Vec<JobId> = self
            .finished_bots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|id| running.iter().all(|job| &job.id != *id))
            .cloned()
            .collect();

        for id in idle {
            match self.stores.jobs.get(&id).await {
                Ok(Some(job)) if !job.status.is_terminal() => {}
                Ok(_) => self.forget_job(&id),
                Err(e) => debug!(job_id = %id, error = %e, "Cannot check job status for pruning"),
            }
        }
    }

    /// Wait until every spawned dispatch task has ended
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    async fn run_job(&self, id: &JobId) {
        match self.process_job(id).await {
            Ok(outcome) => debug!(job_id = %id, outcome = ?outcome, "Dispatch task finished"),
            Err(e) => error!(job_id = %id, error = %e, "Dispatch task failed"),
        }
    }

    /// Dispatch this worker's share of one job
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Store` if the job, its status or a subscriber
    /// listing cannot be read.
    pub async fn process_job(&self, id: &JobId) -> Result<JobOutcome, DispatchError> {
        let Some(job) = self.stores.jobs.get(id).await? else {
            warn!(job_id = %id, "Running job disappeared");
            return Ok(JobOutcome::Missing);
        };

        let bots = self.owned_bots(&job).await?;
        if bots.is_empty() {
            if !job.workers.contains(&self.config.worker) {
                debug!(job_id = %id, worker = %self.config.worker, "No target bot owned here");
                return Ok(JobOutcome::NotOwned);
            }
            // Our bots were reassigned or removed since the job was created.
            info!(job_id = %id, worker = %self.config.worker, "No owned bot left, share is empty");
            return self.finish_share(&job).await;
        }

        info!(
            job_id = %id,
            worker = %self.config.worker,
            bots = bots.len(),
            "Dispatching broadcast share"
        );

        for bot in &bots {
            if self.is_bot_finished(id, &bot.id) {
                debug!(job_id = %id, bot_id = %bot.id, "Bot share already dispatched");
                continue;
            }
            if let Some(stop) = self.interruption(id).await? {
                info!(job_id = %id, outcome = ?stop, "Dispatch interrupted");
                return Ok(self.stopped(id, stop));
            }
            if let Some(stop) = self.dispatch_bot(&job, bot).await? {
                info!(job_id = %id, bot_id = %bot.id, outcome = ?stop, "Dispatch interrupted");
                return Ok(self.stopped(id, stop));
            }
            self.record_bot_finished(id, &bot.id);
        }

        self.forget_job(id);
        self.finish_share(&job).await
    }

    fn is_bot_finished(&self, job: &JobId, bot: &BotId) -> bool {
        self.finished_bots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job)
            .is_some_and(|bots| bots.contains(bot))
    }

    fn record_bot_finished(&self, job: &JobId, bot: &BotId) {
        self.finished_bots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job.clone())
            .or_default()
            .insert(bot.clone());
    }

    fn forget_job(&self, job: &JobId) {
        self.finished_bots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job);
    }

    /// Finished bots are kept for paused jobs only.
    fn stopped(&self, id: &JobId, outcome: JobOutcome) -> JobOutcome {
        if matches!(outcome, JobOutcome::Interrupted(status) if status.is_terminal()) {
            self.forget_job(id);
        }
        outcome
    }

    /// Target bots assigned to this worker, in target order
    async fn owned_bots(&self, job: &BroadcastJob) -> Result<Vec<BotRecord>, StoreError> {
        let mut owned = Vec::new();
        for bot_id in &job.target_bot_ids {
            match self.stores.registry.get(bot_id).await? {
                Some(bot) if bot.is_owned_by(&self.config.worker) => owned.push(bot),
                Some(_) => {}
                None => debug!(job_id = %job.id, bot_id = %bot_id, "Unknown target bot"),
            }
        }
        Ok(owned)
    }

    /// `Some` when dispatch must stop before the next send
    async fn interruption(&self, id: &JobId) -> Result<Option<JobOutcome>, StoreError> {
        if self.shutdown.is_cancelled() {
            return Ok(Some(JobOutcome::ShutDown));
        }

        let status = match self.stores.progress.status(id).await? {
            Some(status) => status,
            None => self
                .stores
                .jobs
                .get(id)
                .await?
                .map_or(JobStatus::Completed, |job| job.status),
        };

        Ok((status != JobStatus::Running).then_some(JobOutcome::Interrupted(status)))
    }

    async fn dispatch_bot(
        &self,
        job: &BroadcastJob,
        bot: &BotRecord,
    ) -> Result<Option<JobOutcome>, StoreError> {
        let transport = match self.transports.get(bot).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(job_id = %job.id, bot_id = %bot.id, error = %e, "Skipping bot without transport");
                return Ok(None);
            }
        };

        let mut subscribers = self.stores.registry.list_subscribers(&bot.id).await?;
        let mut position = 0u64;

        while let Some(user) = subscribers.next().await {
            let user = user?;
            if let Some(stop) = self.interruption(&job.id).await? {
                return Ok(Some(stop));
            }

            self.limiter.acquire().await;
            let delivered = self
                .deliverer
                .deliver(bot, transport.as_ref(), user, &job.content)
                .await;
            self.record_attempt(&job.id, delivered).await;

            position += 1;
            if let Err(e) = self.stores.progress.set_cursor(&job.id, position).await {
                debug!(job_id = %job.id, error = %e, "Cursor update failed");
            }
        }

        debug!(job_id = %job.id, bot_id = %bot.id, attempts = position, "Bot share dispatched");
        Ok(None)
    }

    async fn record_attempt(&self, id: &JobId, delivered: bool) {
        let result = if delivered {
            self.stores.progress.incr_sent(id).await
        } else {
            self.stores.progress.incr_failed(id).await
        };
        if let Err(e) = result {
            warn!(job_id = %id, delivered, error = %e, "Failed to record delivery attempt");
        }
    }

    async fn finish_share(&self, job: &BroadcastJob) -> Result<JobOutcome, DispatchError> {
        let finished = self
            .stores
            .progress
            .mark_worker_done(&job.id, &self.config.worker)
            .await?;

        let pending: Vec<String> = job.workers.difference(&finished).cloned().collect();
        if !pending.is_empty() {
            info!(
                job_id = %job.id,
                worker = %self.config.worker,
                pending = ?pending,
                "Share finished, waiting for other workers"
            );
            return Ok(JobOutcome::ShareFinished { pending });
        }

        self.complete(job).await
    }

    /// Mark the job completed in both stores and copy the counters. Idempotent.
    async fn complete(&self, job: &BroadcastJob) -> Result<JobOutcome, DispatchError> {
        let snapshot = self
            .stores
            .progress
            .get_all(&job.id)
            .await?
            .unwrap_or_default();

        if let Err(e) = self
            .stores
            .progress
            .set_status(&job.id, JobStatus::Completed)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to mirror completion");
        }
        self.stores
            .jobs
            .set_status(&job.id, JobStatus::Completed)
            .await?;
        self.stores
            .jobs
            .set_final_counts(&job.id, snapshot.sent, snapshot.failed)
            .await?;

        info!(
            job_id = %job.id,
            sent = snapshot.sent,
            failed = snapshot.failed,
            "Broadcast job completed"
        );
        Ok(JobOutcome::Completed {
            sent: snapshot.sent,
            failed: snapshot.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_core::lifecycle::JobManager;
    use botfleet_core::media_cache::MokaMediaCache;
    use botfleet_core::model::MessageContent;
    use botfleet_core::testing::{mock_connector, mock_transport_ok, MemoryStores};

    fn dispatcher(stores: &MemoryStores) -> Arc<DispatchLoop> {
        let transport = Arc::new(mock_transport_ok("x"));
        let pool = Arc::new(TransportPool::new(Arc::new(mock_connector(transport)), 10));
        let cache = Arc::new(MokaMediaCache::new(10, Duration::from_secs(60)));
        Arc::new(DispatchLoop::new(
            DispatchConfig {
                worker: "w1".to_string(),
                scan_interval: Duration::from_secs(10),
            },
            stores.stores(),
            pool,
            Deliverer::new(cache),
            Arc::new(RateLimiter::per_second(15)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_bots_dropped_once_job_ends() -> Result<(), Box<dyn std::error::Error>> {
        let stores = MemoryStores::new();
        stores.add_bot("a", Some("w1"), &[1, 2]).await;
        stores.add_bot("b", Some("w1"), &[3, 4]).await;
        let manager = JobManager::new(stores.stores());
        let id = manager
            .create_job(
                vec![BotId::from("a"), BotId::from("b")],
                MessageContent::text("hello"),
            )
            .await?;
        let w1 = dispatcher(&stores);

        // Share paused after its first bot.
        w1.record_bot_finished(&id, &BotId::from("a"));
        manager.pause(&id).await?;
        w1.scan_once().await?;
        assert!(w1.is_bot_finished(&id, &BotId::from("a")));

        manager.cancel(&id).await?;
        w1.scan_once().await?;
        assert!(!w1.is_bot_finished(&id, &BotId::from("a")));
        assert!(w1
            .finished_bots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
        Ok(())
    }
}
