//! Domain model shared by the lifecycle manager and the dispatch loop.

use crate::error::BroadcastError;
use crate::reply::AutoReply;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Chat identifier of a subscriber on a bot's transport.
pub type UserId = i64;

/// Opaque broadcast job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random job id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Bot identity in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(String);

impl BotId {
    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Handle to media already uploaded to the transport, reusable without re-upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(String);

impl MediaRef {
    /// Borrow the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MediaRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a broadcast job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for dispatch.
    Running,
    /// Halted by an operator, resumable.
    Paused,
    /// Finished or cancelled. Terminal.
    Completed,
    /// Abandoned after an unrecoverable error. Terminal.
    Failed,
}

impl JobStatus {
    /// Wire name used by the stores.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses admit no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Health status of a bot, maintained by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    /// Credential accepted by the transport.
    #[default]
    Alive,
    /// Credential rejected or transport unreachable.
    Dead,
    /// Disabled by an operator; skipped by health checks.
    Paused,
}

/// Kind of a broadcast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text message.
    Text,
    /// Photo with optional caption.
    Photo,
    /// Video with optional caption.
    Video,
    /// Audio file with optional caption.
    Audio,
    /// Generic document with optional caption.
    Document,
}

impl ContentKind {
    /// Media kind for the transport, `None` for text.
    #[must_use]
    pub const fn media_kind(self) -> Option<MediaKind> {
        match self {
            Self::Text => None,
            Self::Photo => Some(MediaKind::Photo),
            Self::Video => Some(MediaKind::Video),
            Self::Audio => Some(MediaKind::Audio),
            Self::Document => Some(MediaKind::Document),
        }
    }
}

/// Media-bearing subset of [`ContentKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Photo.
    Photo,
    /// Video.
    Video,
    /// Audio.
    Audio,
    /// Document.
    Document,
}

impl From<MediaKind> for ContentKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Photo => Self::Photo,
            MediaKind::Video => Self::Video,
            MediaKind::Audio => Self::Audio,
            MediaKind::Document => Self::Document,
        }
    }
}

/// Inline button that opens a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlButton {
    /// Visible label.
    pub label: String,
    /// Absolute URL opened on tap.
    pub url: String,
}

impl UrlButton {
    /// Create a button.
    #[must_use]
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Content of a broadcast, as submitted by the administrative UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Message kind.
    pub kind: ContentKind,
    /// Body for [`ContentKind::Text`].
    #[serde(default)]
    pub text: Option<String>,
    /// Original media reference for media kinds.
    #[serde(default)]
    pub media: Option<MediaRef>,
    /// Caption for media kinds.
    #[serde(default)]
    pub caption: Option<String>,
    /// Ordered rows of URL buttons.
    #[serde(default)]
    pub buttons: Vec<Vec<UrlButton>>,
}

impl MessageContent {
    /// Plain text content.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            media: None,
            caption: None,
            buttons: Vec::new(),
        }
    }

    /// Media content referencing an already uploaded file.
    #[must_use]
    pub fn media(kind: MediaKind, media: impl Into<MediaRef>) -> Self {
        Self {
            kind: kind.into(),
            text: None,
            media: Some(media.into()),
            caption: None,
            buttons: Vec::new(),
        }
    }

    /// Attach a caption.
    #[must_use]
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Attach button rows.
    #[must_use]
    pub fn with_buttons(mut self, buttons: Vec<Vec<UrlButton>>) -> Self {
        self.buttons = buttons;
        self
    }

    /// Check the content against its kind.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Validation`] when a text message has no body,
    /// a media kind has no media reference, or a button is malformed.
    pub fn validate(&self) -> Result<(), BroadcastError> {
        match self.kind.media_kind() {
            None => {
                let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
                if !has_text {
                    return Err(BroadcastError::Validation(
                        "text content requires a non-empty body".into(),
                    ));
                }
            }
            Some(kind) => {
                let has_media = self.media.as_ref().is_some_and(|m| !m.as_str().is_empty());
                if !has_media {
                    return Err(BroadcastError::Validation(format!(
                        "{kind:?} content requires a media reference"
                    )));
                }
            }
        }

        for button in self.buttons.iter().flatten() {
            if button.label.trim().is_empty() {
                return Err(BroadcastError::Validation("button label is empty".into()));
            }
            if url::Url::parse(&button.url).is_err() {
                return Err(BroadcastError::Validation(format!(
                    "button '{}' has an invalid url '{}'",
                    button.label, button.url
                )));
            }
        }

        Ok(())
    }
}

/// One broadcast request targeting a set of bots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastJob {
    /// Job id.
    pub id: JobId,
    /// Target bots, in dispatch order.
    pub target_bot_ids: Vec<BotId>,
    /// What to send.
    pub content: MessageContent,
    /// Sum of subscriber counts at creation time.
    pub total: u64,
    /// Durable lifecycle status.
    pub status: JobStatus,
    /// Workers owning at least one target bot at creation time.
    #[serde(default)]
    pub workers: BTreeSet<String>,
    /// Final sent count, copied from the progress store on completion.
    #[serde(default)]
    pub sent: u64,
    /// Final failed count, copied from the progress store on completion.
    #[serde(default)]
    pub failed: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time dispatch became eligible.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl BroadcastJob {
    /// Build a new running job.
    #[must_use]
    pub fn new(
        target_bot_ids: Vec<BotId>,
        content: MessageContent,
        total: u64,
        workers: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            target_bot_ids,
            content,
            total,
            status: JobStatus::Running,
            workers,
            sent: 0,
            failed: 0,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    /// Apply a status change, stamping the completion time on terminal statuses.
    ///
    /// A terminal job never changes status again; returns `false` when the
    /// change is refused.
    pub fn apply_status(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() && self.status != status {
            return false;
        }
        self.status = status;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        true
    }
}

/// Fast-mutating counters of a job, kept in the ephemeral store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressState {
    /// Position of the most recent attempt within the bot being processed.
    pub cursor: u64,
    /// Successful deliveries.
    pub sent: u64,
    /// Failed deliveries.
    pub failed: u64,
    /// Live status mirror; `None` when the status key is missing.
    pub status: Option<JobStatus>,
}

impl ProgressState {
    /// Zeroed counters with status `running`.
    #[must_use]
    pub const fn initial() -> Self {
        Self {
            cursor: 0,
            sent: 0,
            failed: 0,
            status: Some(JobStatus::Running),
        }
    }
}

/// A bot instance registered in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
    /// Bot id.
    pub id: BotId,
    /// Public username, used in reply variables.
    #[serde(default)]
    pub username: String,
    /// Encrypted transport credential.
    pub credential: String,
    /// Worker responsible for this bot.
    pub assigned_worker: Option<String>,
    /// Health status.
    #[serde(default)]
    pub status: BotStatus,
    /// Bot-specific auto reply.
    #[serde(default)]
    pub auto_reply: Option<AutoReply>,
    /// Prefer the worker-level reply.
    #[serde(default = "default_true")]
    pub use_worker_reply: bool,
    /// Prefer the global reply.
    #[serde(default = "default_true")]
    pub use_global_reply: bool,
    /// Last health check time.
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
}

const fn default_true() -> bool {
    true
}

impl BotRecord {
    /// New alive bot with default reply configuration.
    #[must_use]
    pub fn new(id: impl Into<BotId>, credential: impl Into<String>, worker: Option<&str>) -> Self {
        Self {
            id: id.into(),
            username: String::new(),
            credential: credential.into(),
            assigned_worker: worker.map(ToString::to_string),
            status: BotStatus::Alive,
            auto_reply: None,
            use_worker_reply: true,
            use_global_reply: true,
            last_health_check: None,
        }
    }

    /// Whether this bot is assigned to `worker`.
    #[must_use]
    pub fn is_owned_by(&self, worker: &str) -> bool {
        self.assigned_worker.as_deref() == Some(worker)
    }
}
