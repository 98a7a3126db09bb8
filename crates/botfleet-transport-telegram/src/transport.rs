//! Telegram Bot API transport built on teloxide.

use async_trait::async_trait;
use botfleet_core::cipher::CredentialCipher;
use botfleet_core::model::{BotRecord, MediaRef, UrlButton, UserId};
use botfleet_core::transport::{
    BotTransport, DeliveryReceipt, MediaPayload, TextPayload, TransportConnector, TransportError,
};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile};
use teloxide::{ApiError, RequestError};
use tracing::warn;

/// Sets the optional caption and keyboard on a media send request.
macro_rules! decorate {
    ($request:expr, $payload:expr) => {{
        let mut request = $request;
        if let Some(caption) = &$payload.caption {
            request = request.caption(caption.clone());
        }
        if let Some(markup) = keyboard(&$payload.buttons) {
            request = request.reply_markup(markup);
        }
        request
    }};
}

/// Transport for one Telegram bot
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    /// Create a transport from a plaintext bot token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }
}

/// Build an inline keyboard of URL buttons. Buttons with an unparsable URL are dropped.
#[must_use]
pub fn keyboard(rows: &[Vec<UrlButton>]) -> Option<InlineKeyboardMarkup> {
    let rows: Vec<Vec<InlineKeyboardButton>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|button| match url::Url::parse(&button.url) {
                    Ok(url) => Some(InlineKeyboardButton::url(button.label.clone(), url)),
                    Err(e) => {
                        warn!(url = %button.url, error = %e, "Dropping button with invalid URL");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    (!rows.is_empty()).then(|| InlineKeyboardMarkup::new(rows))
}

/// Classify a teloxide error for the dispatch loop
#[must_use]
pub fn map_request_error(error: RequestError) -> TransportError {
    match error {
        RequestError::Api(api) => match api {
            ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation
            | ApiError::BotKicked => TransportError::Recipient(api.to_string()),
            ApiError::WrongFileId | ApiError::WrongFileIdOrUrl | ApiError::FailedToGetUrlContent => {
                TransportError::MediaRejected(api.to_string())
            }
            other => TransportError::Api(other.to_string()),
        },
        RequestError::RetryAfter(after) => TransportError::RateLimited(after.seconds()),
        RequestError::Network(e) => TransportError::Network(e.to_string()),
        RequestError::Io(e) => TransportError::Network(e.to_string()),
        other => TransportError::Api(other.to_string()),
    }
}

fn receipt(media: Option<String>) -> DeliveryReceipt {
    DeliveryReceipt {
        media: media.map(MediaRef::from),
    }
}

fn input_file(media: &MediaRef) -> InputFile {
    InputFile::file_id(FileId(media.as_str().to_string()))
}

#[async_trait]
impl BotTransport for TelegramTransport {
    async fn send_text(
        &self,
        chat_id: UserId,
        payload: &TextPayload,
    ) -> Result<DeliveryReceipt, TransportError> {
        let mut request = self.bot.send_message(ChatId(chat_id), payload.text.clone());
        if let Some(markup) = keyboard(&payload.buttons) {
            request = request.reply_markup(markup);
        }
        request.await.map_err(map_request_error)?;
        Ok(DeliveryReceipt::default())
    }

    async fn send_photo(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError> {
        let request = self.bot.send_photo(ChatId(chat_id), input_file(&payload.media));
        let msg = decorate!(request, payload)
            .await
            .map_err(map_request_error)?;
        // The largest size comes last.
        Ok(receipt(
            msg.photo()
                .and_then(<[_]>::last)
                .map(|size| size.file.id.to_string()),
        ))
    }

    async fn send_video(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError> {
        let request = self.bot.send_video(ChatId(chat_id), input_file(&payload.media));
        let msg = decorate!(request, payload)
            .await
            .map_err(map_request_error)?;
        Ok(receipt(msg.video().map(|video| video.file.id.to_string())))
    }

    async fn send_audio(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError> {
        let request = self.bot.send_audio(ChatId(chat_id), input_file(&payload.media));
        let msg = decorate!(request, payload)
            .await
            .map_err(map_request_error)?;
        Ok(receipt(msg.audio().map(|audio| audio.file.id.to_string())))
    }

    async fn send_document(
        &self,
        chat_id: UserId,
        payload: &MediaPayload,
    ) -> Result<DeliveryReceipt, TransportError> {
        let request = self
            .bot
            .send_document(ChatId(chat_id), input_file(&payload.media));
        let msg = decorate!(request, payload)
            .await
            .map_err(map_request_error)?;
        Ok(receipt(msg.document().map(|doc| doc.file.id.to_string())))
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.bot.get_me().await.map_err(map_request_error)?;
        Ok(())
    }
}

/// Builds Telegram transports from bot records
pub struct TelegramConnector {
    cipher: Option<CredentialCipher>,
}

impl TelegramConnector {
    /// Connector decrypting credentials with `cipher`.
    ///
    /// Without a cipher credentials are used as plaintext tokens.
    #[must_use]
    pub const fn new(cipher: Option<CredentialCipher>) -> Self {
        Self { cipher }
    }

    fn token(&self, bot: &BotRecord) -> Result<String, TransportError> {
        match &self.cipher {
            Some(cipher) => Ok(cipher.decrypt(&bot.credential)?),
            None => Ok(bot.credential.clone()),
        }
    }
}

impl TransportConnector for TelegramConnector {
    fn connect(&self, bot: &BotRecord) -> Result<Arc<dyn BotTransport>, TransportError> {
        let token = self.token(bot)?;
        Ok(Arc::new(TelegramTransport::new(token)))
    }
}
