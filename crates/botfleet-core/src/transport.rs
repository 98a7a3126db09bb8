//! Messaging transport port
//!
//! The dispatch loop talks to a bot's messaging platform only through
//! [`BotTransport`]. Handles are built from a [`BotRecord`] by a
//! [`TransportConnector`].

use crate::cipher::CredentialError;
use crate::model::{BotRecord, MediaKind, MediaRef, UrlButton, UserId};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The recipient cannot receive messages (blocked the bot, chat gone, account deactivated)
    #[error("Recipient unavailable: {0}")]
    Recipient(String),
    /// The media reference was not accepted
    #[error("Media rejected: {0}")]
    MediaRejected(String),
    /// Flood control; retry after the given number of seconds
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u32),
    /// Any other API error
    #[error("API error: {0}")]
    Api(String),
    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),
    /// The bot credential could not be decrypted
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl TransportError {
    /// Failures caused by the recipient rather than the message
    #[must_use]
    pub const fn is_recipient_error(&self) -> bool {
        matches!(self, Self::Recipient(_))
    }

    /// Failures worth retrying as is
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited(_))
    }
}

/// Text message payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPayload {
    /// Message body
    pub text: String,
    /// Ordered rows of URL buttons
    pub buttons: Vec<Vec<UrlButton>>,
}

/// Media message payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    /// Reference to send
    pub media: MediaRef,
    /// Optional caption
    pub caption: Option<String>,
    /// Ordered rows of URL buttons
    pub buttons: Vec<Vec<UrlButton>>,
}

/// What the transport reports after a successful send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Reference the bot can reuse to send the same media again
    pub media: Option<MediaRef>,
}

/// A bot's connection to its messaging platform
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait BotTransport: Send + Sync {
    /// Send a text message
    async fn send_text(
        &self,
        chat_id: UserId,
        payload: &TextPayload,
    ) -> Result<DeliveryReceipt, TransportError>;
    /// Send a photo
    async fn send_photo(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError>;
    /// Send a video
    async fn send_video(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError>;
    /// Send an audio file
    async fn send_audio(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError>;
    /// Send a document
    async fn send_document(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError>;
    /// Check that the credential is accepted
    async fn probe(&self) -> Result<(), TransportError>;
}

/// Send media through the method matching `kind`.
///
/// # Errors
///
/// Propagates the transport's error.
pub async fn send_media(
    transport: &dyn BotTransport,
    kind: MediaKind,
    chat_id: UserId,
    payload: &MediaPayload,
) -> Result<DeliveryReceipt, TransportError> {
    match kind {
        MediaKind::Photo => transport.send_photo(chat_id, payload).await,
        MediaKind::Video => transport.send_video(chat_id, payload).await,
        MediaKind::Audio => transport.send_audio(chat_id, payload).await,
        MediaKind::Document => transport.send_document(chat_id, payload).await,
    }
}

/// Builds transport handles from bot records
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
pub trait TransportConnector: Send + Sync {
    /// Build a handle for `bot`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Credential` if the credential cannot be decrypted.
    fn connect(&self, bot: &BotRecord) -> Result<Arc<dyn BotTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_media_routes_by_kind() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_video()
            .times(1)
            .returning(|_, _| Ok(DeliveryReceipt::default()));
        transport.expect_send_photo().never();

        let payload = MediaPayload {
            media: MediaRef::from("vid"),
            caption: None,
            buttons: Vec::new(),
        };
        let result = send_media(&transport, MediaKind::Video, 7, &payload).await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_error_classes() {
        assert!(TransportError::Recipient("blocked".into()).is_recipient_error());
        assert!(!TransportError::MediaRejected("bad".into()).is_recipient_error());
        assert!(TransportError::Network("reset".into()).is_transient());
        assert!(!TransportError::Credential(CredentialError::Decrypt).is_transient());
    }
}
