//! Redis adapters
//!
//! Progress counters live under `broadcast:{id}:*` and are mutated only with
//! atomic increments. Delivery media references live under
//! `bot:{bot}:file:{original}` with a TTL.

use crate::error::StoreError;
use crate::media_cache::MediaCache;
use crate::model::{BotId, JobId, JobStatus, MediaRef, ProgressState};
use crate::store::ProgressStore;
use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{ClientLike, KeysInterface, SetsInterface};
use fred::types::config::Config as RedisConfig;
use fred::types::Expiration;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connect a Redis client and wait until it is ready.
///
/// # Errors
///
/// Returns `StoreError::Config` for an invalid URL and
/// `StoreError::Ephemeral` if the connection cannot be established.
pub async fn connect(url: &str) -> Result<Arc<RedisClient>, StoreError> {
    let config = RedisConfig::from_url(url)
        .map_err(|e| StoreError::Config(format!("invalid redis url: {e}")))?;
    let client = RedisClient::new(config, None, None, None);
    client.connect();
    client.wait_for_connect().await.map_err(ephemeral)?;
    info!("Connected to Redis progress store");
    Ok(Arc::new(client))
}

fn ephemeral(e: fred::error::Error) -> StoreError {
    StoreError::Ephemeral(e.to_string())
}

fn counter_key(id: &JobId, field: &str) -> String {
    format!("broadcast:{id}:{field}")
}

/// Progress store backed by Redis
#[derive(Clone)]
pub struct RedisProgressStore {
    redis: Arc<RedisClient>,
    terminal_ttl_secs: i64,
}

impl RedisProgressStore {
    /// Create a store whose terminal jobs expire after `terminal_ttl_secs`
    #[must_use]
    pub const fn new(redis: Arc<RedisClient>, terminal_ttl_secs: i64) -> Self {
        Self {
            redis,
            terminal_ttl_secs,
        }
    }

    fn all_keys(id: &JobId) -> Vec<String> {
        ["cursor", "sent", "failed", "status", "done_workers"]
            .into_iter()
            .map(|field| counter_key(id, field))
            .collect()
    }

    async fn expire_all(&self, id: &JobId) -> Result<(), StoreError> {
        for key in Self::all_keys(id) {
            self.redis
                .expire::<(), _>(key, self.terminal_ttl_secs, None)
                .await
                .map_err(ephemeral)?;
        }
        debug!(job_id = %id, ttl = self.terminal_ttl_secs, "Progress keys set to expire");
        Ok(())
    }
}

fn parse_counter(raw: Option<&String>) -> u64 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn init(&self, id: &JobId) -> Result<(), StoreError> {
        let () = self
            .redis
            .mset(vec![
                (counter_key(id, "cursor"), "0".to_string()),
                (counter_key(id, "sent"), "0".to_string()),
                (counter_key(id, "failed"), "0".to_string()),
                (counter_key(id, "status"), JobStatus::Running.as_str().to_string()),
            ])
            .await
            .map_err(ephemeral)?;
        Ok(())
    }

    async fn incr_sent(&self, id: &JobId) -> Result<u64, StoreError> {
        self.redis
            .incr(counter_key(id, "sent"))
            .await
            .map_err(ephemeral)
    }

    async fn incr_failed(&self, id: &JobId) -> Result<u64, StoreError> {
        self.redis
            .incr(counter_key(id, "failed"))
            .await
            .map_err(ephemeral)
    }

    async fn set_cursor(&self, id: &JobId, cursor: u64) -> Result<(), StoreError> {
        self.redis
            .set::<(), _, _>(counter_key(id, "cursor"), cursor.to_string(), None, None, false)
            .await
            .map_err(ephemeral)
    }

    async fn get_all(&self, id: &JobId) -> Result<Option<ProgressState>, StoreError> {
        let values: Vec<Option<String>> = self
            .redis
            .mget(vec![
                counter_key(id, "cursor"),
                counter_key(id, "sent"),
                counter_key(id, "failed"),
                counter_key(id, "status"),
            ])
            .await
            .map_err(ephemeral)?;

        if values.iter().all(Option::is_none) {
            return Ok(None);
        }

        let status = match values.get(3).and_then(Option::as_deref) {
            Some(raw) => match raw.parse::<JobStatus>() {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Ignoring unreadable live status");
                    None
                }
            },
            None => None,
        };

        Ok(Some(ProgressState {
            cursor: parse_counter(values.first().and_then(Option::as_ref)),
            sent: parse_counter(values.get(1).and_then(Option::as_ref)),
            failed: parse_counter(values.get(2).and_then(Option::as_ref)),
            status,
        }))
    }

    async fn status(&self, id: &JobId) -> Result<Option<JobStatus>, StoreError> {
        let raw: Option<String> = self
            .redis
            .get(counter_key(id, "status"))
            .await
            .map_err(ephemeral)?;

        match raw {
            Some(raw) => raw.parse().map(Some).map_err(StoreError::Ephemeral),
            None => Ok(None),
        }
    }

    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        self.redis
            .set::<(), _, _>(
                counter_key(id, "status"),
                status.as_str(),
                None,
                None,
                false,
            )
            .await
            .map_err(ephemeral)?;

        if status.is_terminal() {
            self.expire_all(id).await?;
        }
        Ok(())
    }

    async fn mark_worker_done(
        &self,
        id: &JobId,
        worker: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        let key = counter_key(id, "done_workers");
        self.redis
            .sadd::<(), _, _>(key.clone(), worker)
            .await
            .map_err(ephemeral)?;
        let members: Vec<String> = self.redis.smembers(key).await.map_err(ephemeral)?;
        Ok(members.into_iter().collect())
    }

    async fn is_worker_done(&self, id: &JobId, worker: &str) -> Result<bool, StoreError> {
        self.redis
            .sismember(counter_key(id, "done_workers"), worker)
            .await
            .map_err(ephemeral)
    }

    async fn delete(&self, id: &JobId) -> Result<(), StoreError> {
        self.redis
            .del::<(), _>(Self::all_keys(id))
            .await
            .map_err(ephemeral)
    }
}

/// Media cache backed by Redis
#[derive(Clone)]
pub struct RedisMediaCache {
    redis: Arc<RedisClient>,
    ttl_secs: i64,
}

impl RedisMediaCache {
    /// Create a cache whose entries live `ttl_secs`
    #[must_use]
    pub const fn new(redis: Arc<RedisClient>, ttl_secs: i64) -> Self {
        Self { redis, ttl_secs }
    }
}

/// Redis key of a cached delivery reference
#[must_use]
pub fn media_key(bot_id: &BotId, original: &MediaRef) -> String {
    format!("bot:{bot_id}:file:{original}")
}

#[async_trait]
impl MediaCache for RedisMediaCache {
    async fn get(&self, bot_id: &BotId, original: &MediaRef) -> Option<MediaRef> {
        match self
            .redis
            .get::<Option<String>, _>(media_key(bot_id, original))
            .await
        {
            Ok(cached) => cached.map(MediaRef::from),
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "Media cache lookup failed");
                None
            }
        }
    }

    async fn put(&self, bot_id: &BotId, original: &MediaRef, delivered: MediaRef) {
        let result = self
            .redis
            .set::<(), _, _>(
                media_key(bot_id, original),
                delivered.as_str(),
                Some(Expiration::EX(self.ttl_secs)),
                None,
                false,
            )
            .await;
        if let Err(e) = result {
            warn!(bot_id = %bot_id, error = %e, "Media cache write failed");
        }
    }
}
