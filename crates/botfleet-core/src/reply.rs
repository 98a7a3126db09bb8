//! Auto replies and variable rendering
//!
//! A bot answers incoming messages with the first applicable reply among its
//! own, its worker's and the fleet-wide one. The same variable rendering is
//! used for broadcast bodies.

use crate::error::StoreError;
use crate::model::{BotId, ContentKind, MediaKind, MediaRef, MessageContent, UrlButton, UserId};
use crate::store::{BotRegistry, ReplyStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Name substituted when the recipient's profile field is unknown.
const UNKNOWN_NAME: &str = "User";

/// Media attached to an auto reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMedia {
    /// Media kind
    pub kind: MediaKind,
    /// Uploaded media reference
    pub reference: MediaRef,
}

/// A configured auto reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReply {
    /// Reply text; used as the caption when media is attached
    pub text: String,
    /// Ordered rows of URL buttons
    #[serde(default)]
    pub buttons: Vec<Vec<UrlButton>>,
    /// Optional media
    #[serde(default)]
    pub media: Option<ReplyMedia>,
    /// Whether `{...}` variables are substituted
    #[serde(default = "default_use_variables")]
    pub use_variables: bool,
}

const fn default_use_variables() -> bool {
    true
}

/// Fleet-wide reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalReply {
    /// The reply
    pub reply: AutoReply,
    /// Disabled replies are skipped by the resolver
    pub enabled: bool,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

/// Reply shared by every bot of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    /// Worker name
    pub worker: String,
    /// The reply
    pub reply: AutoReply,
    /// Disabled replies are skipped by the resolver
    pub enabled: bool,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

/// What is known about the recipient of a message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recipient<'a> {
    /// Chat id
    pub user_id: UserId,
    /// First name, if known
    pub first_name: Option<&'a str>,
    /// Username without `@`, if known
    pub username: Option<&'a str>,
}

impl Recipient<'_> {
    /// Recipient known only by id, as during a broadcast.
    #[must_use]
    pub const fn anonymous(user_id: UserId) -> Self {
        Self {
            user_id,
            first_name: None,
            username: None,
        }
    }
}

/// Substitute `{user_name}`, `{user_id}`, `{username}`, `{bot_name}` and
/// `{bot_username}` in `text`.
#[must_use]
pub fn substitute_variables(text: &str, recipient: &Recipient<'_>, bot_username: &str) -> String {
    let bot_name = bot_username.trim_start_matches('@');
    text.replace("{user_name}", recipient.first_name.unwrap_or(UNKNOWN_NAME))
        .replace("{user_id}", &recipient.user_id.to_string())
        .replace("{username}", recipient.username.unwrap_or(UNKNOWN_NAME))
        .replace("{bot_name}", bot_name)
        .replace("{bot_username}", bot_username)
}

impl AutoReply {
    /// Text-only reply.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
            media: None,
            use_variables: true,
        }
    }

    /// Parse `[label](url)` links out of `markup` into one button per row.
    ///
    /// # Examples
    ///
    /// ```
    /// use botfleet_core::reply::AutoReply;
    ///
    /// let reply = AutoReply::from_markup("Hi! [Site](https://example.com)");
    /// assert_eq!(reply.text, "Hi!");
    /// assert_eq!(reply.buttons[0][0].url, "https://example.com");
    /// ```
    #[must_use]
    pub fn from_markup(markup: &str) -> Self {
        let link = lazy_regex::regex!(r"\[([^\]]+)\]\(([^)]+)\)");

        let buttons = link
            .captures_iter(markup)
            .map(|caps| vec![UrlButton::new(&caps[1], &caps[2])])
            .collect();
        let text = link.replace_all(markup, "").trim().to_string();

        Self {
            text,
            buttons,
            media: None,
            use_variables: true,
        }
    }

    /// Reply text for `recipient`, with variables substituted when enabled.
    #[must_use]
    pub fn render(&self, recipient: &Recipient<'_>, bot_username: &str) -> String {
        if self.use_variables {
            substitute_variables(&self.text, recipient, bot_username)
        } else {
            self.text.clone()
        }
    }

    /// Convert into broadcast content so the delivery path can send it.
    #[must_use]
    pub fn to_content(&self) -> MessageContent {
        match &self.media {
            Some(media) => MessageContent {
                kind: ContentKind::from(media.kind),
                text: None,
                media: Some(media.reference.clone()),
                caption: Some(self.text.clone()).filter(|t| !t.is_empty()),
                buttons: self.buttons.clone(),
            },
            None => MessageContent::text(self.text.clone()).with_buttons(self.buttons.clone()),
        }
    }
}

/// Picks the reply a bot should send.
pub struct ReplyResolver {
    registry: Arc<dyn BotRegistry>,
    replies: Arc<dyn ReplyStore>,
}

impl ReplyResolver {
    /// Create a resolver over the registry and reply store.
    #[must_use]
    pub fn new(registry: Arc<dyn BotRegistry>, replies: Arc<dyn ReplyStore>) -> Self {
        Self { registry, replies }
    }

    /// Resolve the reply for `bot_id`; `None` for unknown bots or when nothing applies.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the registry or reply store fails.
    pub async fn resolve(&self, bot_id: &BotId) -> Result<Option<AutoReply>, StoreError> {
        let Some(bot) = self.registry.get(bot_id).await? else {
            debug!(bot_id = %bot_id, "Reply requested for unknown bot");
            return Ok(None);
        };

        if let Some(own) = &bot.auto_reply {
            if !bot.use_global_reply {
                return Ok(Some(own.clone()));
            }
        }

        if bot.use_worker_reply {
            if let Some(worker) = bot.assigned_worker.as_deref() {
                if let Some(shared) = self.replies.worker_reply(worker).await? {
                    if shared.enabled {
                        return Ok(Some(shared.reply));
                    }
                }
            }
        }

        if bot.use_global_reply {
            if let Some(global) = self.replies.global_reply().await? {
                if global.enabled {
                    return Ok(Some(global.reply));
                }
            }
        }

        Ok(bot.auto_reply)
    }
}
