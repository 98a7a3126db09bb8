//! Delivery of one message to one subscriber
//!
//! Media is sent through the bot's cached reference when one is known, which
//! avoids re-uploading the same file for every subscriber. If the transport
//! rejects the cached reference the original is sent and the cache refreshed.

use botfleet_core::media_cache::MediaCache;
use botfleet_core::model::{BotRecord, MediaKind, MessageContent, UserId};
use botfleet_core::reply::{substitute_variables, Recipient};
use botfleet_core::transport::{
    send_media, BotTransport, MediaPayload, TextPayload, TransportError,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends content to single subscribers
pub struct Deliverer {
    media_cache: Arc<dyn MediaCache>,
}

impl Deliverer {
    /// Create a deliverer backed by `media_cache`
    #[must_use]
    pub fn new(media_cache: Arc<dyn MediaCache>) -> Self {
        Self { media_cache }
    }

    /// Deliver `content` to `user` through `bot`. Never fails; returns whether it was sent.
    pub async fn deliver(
        &self,
        bot: &BotRecord,
        transport: &dyn BotTransport,
        user: UserId,
        content: &MessageContent,
    ) -> bool {
        let recipient = Recipient::anonymous(user);
        let render = |text: &str| substitute_variables(text, &recipient, &bot.username);

        let result = match content.kind.media_kind() {
            None => {
                let payload = TextPayload {
                    text: render(content.text.as_deref().unwrap_or_default()),
                    buttons: content.buttons.clone(),
                };
                transport.send_text(user, &payload).await.map(|_| ())
            }
            Some(kind) => match &content.media {
                Some(original) => {
                    let payload = MediaPayload {
                        media: original.clone(),
                        caption: content.caption.as_deref().map(render),
                        buttons: content.buttons.clone(),
                    };
                    self.deliver_media(bot, transport, kind, user, payload).await
                }
                None => Err(TransportError::MediaRejected("no media reference".into())),
            },
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(bot_id = %bot.id, user_id = user, error = %e, "Delivery failed");
                false
            }
        }
    }

    /// Send `payload`, whose media is the original reference, preferring the cached one.
    async fn deliver_media(
        &self,
        bot: &BotRecord,
        transport: &dyn BotTransport,
        kind: MediaKind,
        user: UserId,
        payload: MediaPayload,
    ) -> Result<(), TransportError> {
        let original = payload.media.clone();

        if let Some(cached) = self.media_cache.get(&bot.id, &original).await {
            let reuse = MediaPayload {
                media: cached,
                ..payload.clone()
            };
            match send_media(transport, kind, user, &reuse).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_recipient_error() => return Err(e),
                Err(e) => {
                    warn!(
                        bot_id = %bot.id,
                        error = %e,
                        "Cached media reference rejected, resending original"
                    );
                }
            }
        }

        let receipt = send_media(transport, kind, user, &payload).await?;
        if let Some(delivered) = receipt.media {
            self.media_cache.put(&bot.id, &original, delivered).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_core::media_cache::MokaMediaCache;
    use botfleet_core::model::{BotId, MediaRef};
    use botfleet_core::testing::mock_transport_ok;
    use botfleet_core::transport::{DeliveryReceipt, MockBotTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn deliverer() -> (Deliverer, Arc<MokaMediaCache>) {
        let cache = Arc::new(MokaMediaCache::new(100, Duration::from_secs(60)));
        (Deliverer::new(cache.clone()), cache)
    }

    fn bot() -> BotRecord {
        let mut bot = BotRecord::new("b1", "c", Some("w1"));
        bot.username = "@fleet_bot".into();
        bot
    }

    #[tokio::test]
    async fn test_same_photo_uses_original_once() {
        let (deliverer, _) = deliverer();
        let original_sends = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&original_sends);

        let mut transport = MockBotTransport::new();
        transport
            .expect_send_photo()
            .times(2)
            .returning(move |_, payload| {
                if payload.media.as_str() == "upload" {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(DeliveryReceipt {
                    media: Some(MediaRef::from("file-1")),
                })
            });

        let content = MessageContent::media(MediaKind::Photo, "upload");
        assert!(deliverer.deliver(&bot(), &transport, 1, &content).await);
        assert!(deliverer.deliver(&bot(), &transport, 2, &content).await);
        assert_eq!(original_sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_cache_entry_falls_back_and_refreshes() {
        let (deliverer, cache) = deliverer();
        let bot = bot();
        let original = MediaRef::from("upload");
        cache.put(&bot.id, &original, MediaRef::from("stale")).await;

        let mut transport = MockBotTransport::new();
        transport
            .expect_send_video()
            .times(2)
            .returning(|_, payload| match payload.media.as_str() {
                "stale" => Err(TransportError::MediaRejected("wrong file id".into())),
                _ => Ok(DeliveryReceipt {
                    media: Some(MediaRef::from("fresh")),
                }),
            });

        let content = MessageContent::media(MediaKind::Video, "upload");
        assert!(deliverer.deliver(&bot, &transport, 1, &content).await);
        assert_eq!(cache.get(&bot.id, &original).await, Some(MediaRef::from("fresh")));
    }

    #[tokio::test]
    async fn test_recipient_error_skips_fallback() {
        let (deliverer, cache) = deliverer();
        let bot = bot();
        let original = MediaRef::from("upload");
        cache.put(&bot.id, &original, MediaRef::from("cached")).await;

        let mut transport = MockBotTransport::new();
        transport
            .expect_send_document()
            .times(1)
            .returning(|_, _| Err(TransportError::Recipient("bot was blocked".into())));

        let content = MessageContent::media(MediaKind::Document, "upload");
        assert!(!deliverer.deliver(&bot, &transport, 1, &content).await);
    }

    #[tokio::test]
    async fn test_text_is_rendered_per_recipient() {
        let (deliverer, _) = deliverer();
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_text()
            .withf(|chat, payload| *chat == 42 && payload.text == "Hi 42 from fleet_bot")
            .times(1)
            .returning(|_, _| Ok(DeliveryReceipt::default()));

        let content = MessageContent::text("Hi {user_id} from {bot_name}");
        assert!(deliverer.deliver(&bot(), &transport, 42, &content).await);
    }

    #[tokio::test]
    async fn test_media_cache_is_per_bot() {
        let (deliverer, cache) = deliverer();
        let transport = mock_transport_ok("b1");
        let content = MessageContent::media(MediaKind::Audio, "upload");

        assert!(deliverer.deliver(&bot(), &transport, 1, &content).await);
        let original = MediaRef::from("upload");
        assert_eq!(
            cache.get(&BotId::from("b1"), &original).await,
            Some(MediaRef::from("b1:upload"))
        );
        assert!(cache.get(&BotId::from("b2"), &original).await.is_none());
    }

    #[tokio::test]
    async fn test_network_failure_is_reported_as_false() {
        let (deliverer, _) = deliverer();
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_text()
            .returning(|_, _| Err(TransportError::Network("connection reset".into())));

        assert!(
            !deliverer
                .deliver(&bot(), &transport, 1, &MessageContent::text("hi"))
                .await
        );
    }
}
