use crate::error::StoreError;
use crate::model::{
    BotId, BotRecord, BotStatus, BroadcastJob, JobId, JobStatus, ProgressState, UserId,
};
use crate::reply::{GlobalReply, WorkerReply};
use crate::store::{BotRegistry, JobStore, ProgressStore, ReplyStore, SubscriberStream};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{Mutex, RwLock};

/// Job store kept in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, BroadcastJob>>,
}

impl MemoryJobStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &BroadcastJob) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn get(&self, id: &JobId) -> Result<Option<BroadcastJob>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.get_mut(id).is_some_and(|job| job.apply_status(status)))
    }

    async fn set_final_counts(
        &self,
        id: &JobId,
        sent: u64,
        failed: u64,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs
            .get_mut(id)
            .map(|job| {
                job.sent = sent;
                job.failed = failed;
            })
            .is_some())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<BroadcastJob>, StoreError> {
        let mut matching: Vec<BroadcastJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|job| job.created_at);
        Ok(matching)
    }
}

/// Counters of one job. Mirrors the Redis layout: every field may be absent.
#[derive(Default)]
struct ProgressEntry {
    cursor: u64,
    sent: u64,
    failed: u64,
    status: Option<JobStatus>,
    done_workers: BTreeSet<String>,
}

impl ProgressEntry {
    const fn snapshot(&self) -> ProgressState {
        ProgressState {
            cursor: self.cursor,
            sent: self.sent,
            failed: self.failed,
            status: self.status,
        }
    }
}

/// Progress store kept in process memory.
#[derive(Default)]
pub struct MemoryProgressStore {
    entries: Mutex<HashMap<JobId, ProgressEntry>>,
}

impl MemoryProgressStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn init(&self, id: &JobId) -> Result<(), StoreError> {
        let initial = ProgressState::initial();
        self.entries.lock().await.insert(
            id.clone(),
            ProgressEntry {
                cursor: initial.cursor,
                sent: initial.sent,
                failed: initial.failed,
                status: initial.status,
                done_workers: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn incr_sent(&self, id: &JobId) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(id.clone()).or_default();
        entry.sent += 1;
        Ok(entry.sent)
    }

    async fn incr_failed(&self, id: &JobId) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(id.clone()).or_default();
        entry.failed += 1;
        Ok(entry.failed)
    }

    async fn set_cursor(&self, id: &JobId, cursor: u64) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .entry(id.clone())
            .or_default()
            .cursor = cursor;
        Ok(())
    }

    async fn get_all(&self, id: &JobId) -> Result<Option<ProgressState>, StoreError> {
        Ok(self.entries.lock().await.get(id).map(ProgressEntry::snapshot))
    }

    async fn status(&self, id: &JobId) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.entries.lock().await.get(id).and_then(|e| e.status))
    }

    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .entry(id.clone())
            .or_default()
            .status = Some(status);
        Ok(())
    }

    async fn mark_worker_done(
        &self,
        id: &JobId,
        worker: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(id.clone()).or_default();
        entry.done_workers.insert(worker.to_string());
        Ok(entry.done_workers.clone())
    }

    async fn is_worker_done(&self, id: &JobId, worker: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(id)
            .is_some_and(|e| e.done_workers.contains(worker)))
    }

    async fn delete(&self, id: &JobId) -> Result<(), StoreError> {
        self.entries.lock().await.remove(id);
        Ok(())
    }
}

/// Bot registry kept in process memory. Listing order is insertion order.
#[derive(Default)]
pub struct MemoryBotRegistry {
    bots: RwLock<Vec<BotRecord>>,
    subscribers: RwLock<HashMap<BotId, Vec<UserId>>>,
}

impl MemoryBotRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a bot
    pub async fn insert_bot(&self, bot: BotRecord) {
        let mut bots = self.bots.write().await;
        match bots.iter_mut().find(|b| b.id == bot.id) {
            Some(existing) => *existing = bot,
            None => bots.push(bot),
        }
    }

    /// Append subscribers to a bot
    pub async fn add_subscribers(&self, bot_id: &BotId, users: impl IntoIterator<Item = UserId>) {
        self.subscribers
            .write()
            .await
            .entry(bot_id.clone())
            .or_default()
            .extend(users);
    }
}

#[async_trait]
impl BotRegistry for MemoryBotRegistry {
    async fn get(&self, id: &BotId) -> Result<Option<BotRecord>, StoreError> {
        Ok(self.bots.read().await.iter().find(|b| &b.id == id).cloned())
    }

    async fn list_by_worker(&self, worker: &str) -> Result<Vec<BotRecord>, StoreError> {
        Ok(self
            .bots
            .read()
            .await
            .iter()
            .filter(|b| b.is_owned_by(worker))
            .cloned()
            .collect())
    }

    async fn count_subscribers(&self, id: &BotId) -> Result<u64, StoreError> {
        Ok(self
            .subscribers
            .read()
            .await
            .get(id)
            .map_or(0, |users| users.len() as u64))
    }

    async fn list_subscribers(&self, id: &BotId) -> Result<SubscriberStream, StoreError> {
        let users = self
            .subscribers
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok(stream::iter(users.into_iter().map(Ok)).boxed())
    }

    async fn set_status(&self, id: &BotId, status: BotStatus) -> Result<bool, StoreError> {
        let mut bots = self.bots.write().await;
        Ok(bots
            .iter_mut()
            .find(|b| &b.id == id)
            .map(|bot| {
                bot.status = status;
                bot.last_health_check = Some(Utc::now());
            })
            .is_some())
    }
}

/// Reply store kept in process memory.
#[derive(Default)]
pub struct MemoryReplyStore {
    global: RwLock<Option<GlobalReply>>,
    workers: RwLock<HashMap<String, WorkerReply>>,
}

impl MemoryReplyStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplyStore for MemoryReplyStore {
    async fn global_reply(&self) -> Result<Option<GlobalReply>, StoreError> {
        Ok(self.global.read().await.clone())
    }

    async fn worker_reply(&self, worker: &str) -> Result<Option<WorkerReply>, StoreError> {
        Ok(self.workers.read().await.get(worker).cloned())
    }

    async fn set_global_reply(&self, reply: &GlobalReply) -> Result<(), StoreError> {
        *self.global.write().await = Some(reply.clone());
        Ok(())
    }

    async fn set_worker_reply(&self, reply: &WorkerReply) -> Result<(), StoreError> {
        self.workers
            .write()
            .await
            .insert(reply.worker.clone(), reply.clone());
        Ok(())
    }
}
