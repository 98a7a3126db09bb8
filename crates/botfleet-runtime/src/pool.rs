//! Transport handle pool
//!
//! Building a transport decrypts the bot credential, so handles are built
//! lazily and kept for the life of the process. Health checks evict handles of
//! dead bots so that a rotated credential is picked up.

use botfleet_core::model::{BotId, BotRecord};
use botfleet_core::transport::{BotTransport, TransportConnector, TransportError};
use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;

/// Lazily built, cached transport handles keyed by bot
pub struct TransportPool {
    connector: Arc<dyn TransportConnector>,
    handles: Cache<BotId, Arc<dyn BotTransport>>,
}

impl TransportPool {
    /// Create a pool holding at most `capacity` handles
    #[must_use]
    pub fn new(connector: Arc<dyn TransportConnector>, capacity: u64) -> Self {
        Self {
            connector,
            handles: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Handle for `bot`, built on first use
    ///
    /// # Errors
    ///
    /// Returns the connector's error if no handle is cached and one cannot be built.
    pub async fn get(&self, bot: &BotRecord) -> Result<Arc<dyn BotTransport>, TransportError> {
        if let Some(handle) = self.handles.get(&bot.id).await {
            return Ok(handle);
        }

        let handle = self.connector.connect(bot)?;
        self.handles
            .insert(bot.id.clone(), Arc::clone(&handle))
            .await;
        debug!(bot_id = %bot.id, "Transport handle built");
        Ok(handle)
    }

    /// Drop the cached handle of `bot_id`
    pub async fn invalidate(&self, bot_id: &BotId) {
        self.handles.invalidate(bot_id).await;
    }
}
