//! Testing helpers and mock utilities.
//!
//! Provides fixtures for the in-memory stores and convenient constructors for
//! mocked transports.

use crate::model::{BotId, BotRecord, MediaRef, UserId};
use crate::store::memory::{MemoryBotRegistry, MemoryJobStore, MemoryProgressStore};
use crate::store::Stores;
use crate::transport::{
    BotTransport, DeliveryReceipt, MockBotTransport, MockTransportConnector, TransportError,
};
use std::sync::Arc;

/// In-memory stores with typed handles kept for assertions.
pub struct MemoryStores {
    /// Durable job records
    pub jobs: Arc<MemoryJobStore>,
    /// Ephemeral counters
    pub progress: Arc<MemoryProgressStore>,
    /// Bots and subscribers
    pub registry: Arc<MemoryBotRegistry>,
}

impl MemoryStores {
    /// Empty stores
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            progress: Arc::new(MemoryProgressStore::new()),
            registry: Arc::new(MemoryBotRegistry::new()),
        }
    }

    /// Register a bot owned by `worker` with the given subscribers.
    pub async fn add_bot(&self, bot_id: &str, worker: Option<&str>, subscribers: &[UserId]) {
        let mut bot = BotRecord::new(bot_id, format!("credential-{bot_id}"), worker);
        bot.username = format!("@{bot_id}_bot");
        self.registry.insert_bot(bot).await;
        self.registry
            .add_subscribers(&BotId::from(bot_id), subscribers.iter().copied())
            .await;
    }

    /// Trait-object handles for the lifecycle manager and dispatch loop.
    #[must_use]
    pub fn stores(&self) -> Stores {
        Stores::new(
            self.jobs.clone(),
            self.progress.clone(),
            self.registry.clone(),
        )
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a mock transport where every send succeeds.
///
/// Media sends return `{bot_id}:{original}` as the reusable reference, and
/// `probe` succeeds.
///
/// # Example
///
/// ```rust,ignore
/// use botfleet_core::testing::mock_transport_ok;
///
/// let transport = mock_transport_ok("b1");
/// ```
#[must_use]
pub fn mock_transport_ok(bot_id: &str) -> MockBotTransport {
    let mut mock = MockBotTransport::new();
    let prefix = bot_id.to_string();

    mock.expect_send_text()
        .returning(|_, _| Ok(DeliveryReceipt::default()));

    let reissue = move |original: &MediaRef| -> Result<DeliveryReceipt, TransportError> {
        Ok(DeliveryReceipt {
            media: Some(MediaRef::from(format!("{prefix}:{original}"))),
        })
    };
    let photo = reissue.clone();
    mock.expect_send_photo()
        .returning(move |_, payload| photo(&payload.media));
    let video = reissue.clone();
    mock.expect_send_video()
        .returning(move |_, payload| video(&payload.media));
    let audio = reissue.clone();
    mock.expect_send_audio()
        .returning(move |_, payload| audio(&payload.media));
    mock.expect_send_document()
        .returning(move |_, payload| reissue(&payload.media));

    mock.expect_probe().returning(|| Ok(()));

    mock
}

/// Create a mock transport whose `probe` always fails with `error`.
#[must_use]
pub fn mock_transport_dead(error: TransportError) -> MockBotTransport {
    let mut mock = MockBotTransport::new();
    mock.expect_probe().returning(move || Err(error.clone()));
    mock
}

/// Create a mock connector handing out `transport` for every bot.
#[must_use]
pub fn mock_connector(transport: Arc<dyn BotTransport>) -> MockTransportConnector {
    let mut mock = MockTransportConnector::new();
    mock.expect_connect()
        .returning(move |_| Ok(Arc::clone(&transport)));
    mock
}
