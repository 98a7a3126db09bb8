//! Object store adapter
//!
//! Jobs, bots, subscriber pages and replies are JSON documents in an R2/S3
//! bucket. Bot and reply reads go through a short-lived cache; job reads
//! always hit the bucket because their status is changed by other processes.

use crate::config::Settings;
use crate::error::StoreError;
use crate::model::{BotId, BotRecord, BotStatus, BroadcastJob, JobId, JobStatus, UserId};
use crate::reply::{GlobalReply, WorkerReply};
use crate::store::{BotRegistry, JobStore, ReplyStore, SubscriberStream};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// R2-backed store for jobs, bots and replies
pub struct R2Storage {
    client: Client,
    bucket: String,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl R2Storage {
    /// Create a new R2 storage instance
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StoreError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StoreError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-storage");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        // Registry edits made from the admin UI become visible within a minute.
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(60))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
            cache,
        })
    }

    /// Save data as JSON to R2, refreshing the read cache
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization or S3 upload fails.
    pub async fn save_json<T: Serialize + Sync>(
        &self,
        key: &str,
        data: &T,
    ) -> Result<(), StoreError> {
        let body_bytes = serde_json::to_vec_pretty(data)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body_bytes.clone()))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StoreError::Durable(e.to_string()))?;

        self.cache
            .insert(key.to_string(), Arc::new(body_bytes))
            .await;
        Ok(())
    }

    /// Load JSON from R2, bypassing the cache
    ///
    /// # Errors
    ///
    /// Returns an error if S3 download or JSON deserialization fails.
    pub async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match fetch_bytes(&self.client, &self.bucket, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load JSON through the read cache
    ///
    /// # Errors
    ///
    /// Returns an error if S3 download or JSON deserialization fails.
    pub async fn load_json_cached<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        if let Some(cached) = self.cache.get(key).await {
            match serde_json::from_slice(&cached) {
                Ok(data) => return Ok(Some(data)),
                Err(e) => {
                    warn!("Cache deserialization failed for {}: {}", key, e);
                    self.cache.invalidate(key).await;
                }
            }
        }

        let Some(bytes) = fetch_bytes(&self.client, &self.bucket, key).await? else {
            return Ok(None);
        };
        let data = serde_json::from_slice(&bytes)?;
        self.cache.insert(key.to_string(), Arc::new(bytes)).await;
        Ok(Some(data))
    }

    /// Delete object from R2
    ///
    /// # Errors
    ///
    /// Returns an error if S3 deletion fails.
    pub async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(key).await;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Durable(e.to_string()))?;

        Ok(())
    }

    /// List every key under `prefix`, in lexicographic order
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StoreError::Durable(e.to_string()))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(ToString::to_string)),
            );

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    /// Read-modify-write a job document. Returns `false` if it does not exist
    /// or the modifier refuses the change; nothing is written then.
    async fn modify_job<F>(&self, id: &JobId, modifier: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut BroadcastJob) -> bool + Send,
    {
        let key = job_key(id);
        let Some(mut job) = self.load_json::<BroadcastJob>(&key).await? else {
            return Ok(false);
        };
        if !modifier(&mut job) {
            return Ok(false);
        }
        self.save_json(&key, &job).await?;
        Ok(true)
    }

    /// Check connection to R2 storage
    ///
    /// # Errors
    ///
    /// Returns the connectivity error as text.
    pub async fn check_connection(&self) -> Result<(), String> {
        match self.client.list_buckets().send().await {
            Ok(_) => {
                info!("Successfully connected to R2 storage.");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(err_msg)
            }
        }
    }
}

async fn fetch_bytes(client: &Client, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let result = client.get_object().bucket(bucket).key(key).send().await;

    match result {
        Ok(output) => {
            let data = output
                .body
                .collect()
                .await
                .map_err(|e| StoreError::Durable(e.to_string()))?
                .into_bytes();
            Ok(Some(data.to_vec()))
        }
        Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
        Err(e) => Err(StoreError::Durable(e.to_string())),
    }
}

#[async_trait]
impl JobStore for R2Storage {
    async fn insert(&self, job: &BroadcastJob) -> Result<bool, StoreError> {
        let key = job_key(&job.id);
        if fetch_bytes(&self.client, &self.bucket, &key).await?.is_some() {
            return Ok(false);
        }
        self.save_json(&key, job).await?;
        Ok(true)
    }

    async fn get(&self, id: &JobId) -> Result<Option<BroadcastJob>, StoreError> {
        self.load_json(&job_key(id)).await
    }

    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<bool, StoreError> {
        self.modify_job(id, |job| job.apply_status(status)).await
    }

    async fn set_final_counts(
        &self,
        id: &JobId,
        sent: u64,
        failed: u64,
    ) -> Result<bool, StoreError> {
        self.modify_job(id, |job| {
            job.sent = sent;
            job.failed = failed;
            true
        })
        .await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<BroadcastJob>, StoreError> {
        let mut jobs = Vec::new();
        for key in self.list_keys(JOBS_PREFIX).await? {
            match self.load_json::<BroadcastJob>(&key).await {
                Ok(Some(job)) if job.status == status => jobs.push(job),
                Ok(_) => {}
                Err(StoreError::Json(e)) => warn!(key = %key, error = %e, "Skipping malformed job"),
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

#[async_trait]
impl BotRegistry for R2Storage {
    async fn get(&self, id: &BotId) -> Result<Option<BotRecord>, StoreError> {
        self.load_json_cached(&bot_key(id)).await
    }

    async fn list_by_worker(&self, worker: &str) -> Result<Vec<BotRecord>, StoreError> {
        let mut bots = Vec::new();
        for key in self.list_keys(BOTS_PREFIX).await? {
            if !is_bot_record_key(&key) {
                continue;
            }
            if let Some(bot) = self.load_json_cached::<BotRecord>(&key).await? {
                if bot.is_owned_by(worker) {
                    bots.push(bot);
                }
            }
        }
        Ok(bots)
    }

    async fn count_subscribers(&self, id: &BotId) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for key in self.list_keys(&subscriber_prefix(id)).await? {
            if let Some(page) = self.load_json::<Vec<UserId>>(&key).await? {
                total += page.len() as u64;
            }
        }
        Ok(total)
    }

    async fn list_subscribers(&self, id: &BotId) -> Result<SubscriberStream, StoreError> {
        let pages = self.list_keys(&subscriber_prefix(id)).await?;
        let client = self.client.clone();
        let bucket = self.bucket.clone();

        let users = stream::iter(pages)
            .then(move |key| {
                let client = client.clone();
                let bucket = bucket.clone();
                async move {
                    let page = match fetch_bytes(&client, &bucket, &key).await? {
                        Some(bytes) => serde_json::from_slice::<Vec<UserId>>(&bytes)?,
                        None => Vec::new(),
                    };
                    Ok::<_, StoreError>(page)
                }
            })
            .flat_map(|page: Result<Vec<UserId>, StoreError>| {
                let items: Vec<Result<UserId, StoreError>> = match page {
                    Ok(ids) => ids.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            });

        Ok(users.boxed())
    }

    async fn set_status(&self, id: &BotId, status: BotStatus) -> Result<bool, StoreError> {
        let key = bot_key(id);
        let Some(mut bot) = self.load_json::<BotRecord>(&key).await? else {
            return Ok(false);
        };
        bot.status = status;
        bot.last_health_check = Some(Utc::now());
        self.save_json(&key, &bot).await?;
        Ok(true)
    }
}

#[async_trait]
impl ReplyStore for R2Storage {
    async fn global_reply(&self) -> Result<Option<GlobalReply>, StoreError> {
        self.load_json_cached(GLOBAL_REPLY_KEY).await
    }

    async fn worker_reply(&self, worker: &str) -> Result<Option<WorkerReply>, StoreError> {
        self.load_json_cached(&worker_reply_key(worker)).await
    }

    async fn set_global_reply(&self, reply: &GlobalReply) -> Result<(), StoreError> {
        self.save_json(GLOBAL_REPLY_KEY, reply).await
    }

    async fn set_worker_reply(&self, reply: &WorkerReply) -> Result<(), StoreError> {
        self.save_json(&worker_reply_key(&reply.worker), reply).await
    }
}

const JOBS_PREFIX: &str = "jobs/";
const BOTS_PREFIX: &str = "bots/";
const GLOBAL_REPLY_KEY: &str = "replies/global.json";

/// Returns the R2 key of a job document
#[must_use]
pub fn job_key(id: &JobId) -> String {
    format!("{JOBS_PREFIX}{id}.json")
}

/// Returns the R2 key of a bot record
#[must_use]
pub fn bot_key(id: &BotId) -> String {
    format!("{BOTS_PREFIX}{id}.json")
}

/// Returns the R2 prefix under which a bot's subscriber pages live
#[must_use]
pub fn subscriber_prefix(id: &BotId) -> String {
    format!("{BOTS_PREFIX}{id}/subscribers/")
}

/// Returns the R2 key of one subscriber page
#[must_use]
pub fn subscriber_page_key(id: &BotId, page: u32) -> String {
    format!("{}{page:06}.json", subscriber_prefix(id))
}

/// Returns the R2 key of a worker-level reply
#[must_use]
pub fn worker_reply_key(worker: &str) -> String {
    format!("replies/workers/{worker}.json")
}

/// `bots/{id}.json`, as opposed to the per-bot subscriber pages.
fn is_bot_record_key(key: &str) -> bool {
    key.strip_prefix(BOTS_PREFIX)
        .is_some_and(|rest| !rest.contains('/') && rest.ends_with(".json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let bot = BotId::from("b1");
        assert_eq!(job_key(&JobId::from("j1")), "jobs/j1.json");
        assert_eq!(bot_key(&bot), "bots/b1.json");
        assert_eq!(subscriber_page_key(&bot, 3), "bots/b1/subscribers/000003.json");
        assert_eq!(worker_reply_key("w1"), "replies/workers/w1.json");
    }

    #[test]
    fn test_subscriber_pages_are_not_bot_records() {
        assert!(is_bot_record_key("bots/b1.json"));
        assert!(!is_bot_record_key("bots/b1/subscribers/000000.json"));
        assert!(!is_bot_record_key("jobs/j1.json"));
    }

    #[test]
    fn test_subscriber_pages_sort_in_page_order() {
        let bot = BotId::from("b1");
        let mut keys = vec![subscriber_page_key(&bot, 10), subscriber_page_key(&bot, 2)];
        keys.sort();
        assert_eq!(keys[0], subscriber_page_key(&bot, 2));
    }
}
