//! Per-bot cache of delivery-ready media references
//!
//! A media reference uploaded through one bot is not valid for another, so
//! entries are keyed by bot and original reference. The cache is best-effort:
//! lookups and writes never fail the delivery.

use crate::model::{BotId, MediaRef};
use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;

/// Cache of delivery-ready media references
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait MediaCache: Send + Sync {
    /// Reference reusable by `bot_id` for `original`, if known
    async fn get(&self, bot_id: &BotId, original: &MediaRef) -> Option<MediaRef>;
    /// Remember the reference returned by the transport
    async fn put(&self, bot_id: &BotId, original: &MediaRef, delivered: MediaRef);
}

/// In-process media cache
///
/// # Examples
///
/// ```no_run
/// # use botfleet_core::media_cache::{MediaCache, MokaMediaCache};
/// # use botfleet_core::model::{BotId, MediaRef};
/// # use std::time::Duration;
/// # async fn example() {
/// let cache = MokaMediaCache::new(1_000, Duration::from_secs(60));
/// let bot = BotId::from("b1");
/// let original = MediaRef::from("upload-1");
/// cache.put(&bot, &original, MediaRef::from("file-1")).await;
/// assert_eq!(cache.get(&bot, &original).await, Some(MediaRef::from("file-1")));
/// # }
/// ```
pub struct MokaMediaCache {
    entries: Cache<(BotId, MediaRef), MediaRef>,
}

impl MokaMediaCache {
    /// Create a cache bounded by `capacity` entries, each living `ttl`
    #[must_use]
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl MediaCache for MokaMediaCache {
    async fn get(&self, bot_id: &BotId, original: &MediaRef) -> Option<MediaRef> {
        self.entries.get(&(bot_id.clone(), original.clone())).await
    }

    async fn put(&self, bot_id: &BotId, original: &MediaRef, delivered: MediaRef) {
        self.entries
            .insert((bot_id.clone(), original.clone()), delivered)
            .await;
    }
}
