// Core data structures for the syndication engine

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Bot identity id as stored in the configuration store
pub type BotId = i64;

/// Publication task id
pub type TaskId = i64;

/// Channel record id (not the network id)
pub type ChannelId = i64;

/// Errors raised while building model values from external input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("unsupported channel reference: {0}")]
    UnsupportedReference(String),

    #[error("invalid time slot: weekday {weekday}, offset {offset_secs}s")]
    InvalidSlot { weekday: u8, offset_secs: u32 },

    #[error("unknown {field} value: {value}")]
    UnknownVariant { field: &'static str, value: String },
}

// ============================================================================
// Identities
// ============================================================================

/// Transport credentials of a bot identity
#[derive(Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_id: i32,
    pub api_hash: String,
    pub session: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("session", &"<redacted>")
            .finish()
    }
}

/// A messaging identity that owns publication tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: BotId,
    pub name: String,
    pub credentials: Credentials,
    pub is_active: bool,
}

// ============================================================================
// Tasks and slots
// ============================================================================

/// How a post is picked from the source feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChoiceMode {
    #[default]
    Random,
    Sequential,
    First,
}

impl ChoiceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Sequential => "sequential",
            Self::First => "first",
        }
    }
}

impl std::str::FromStr for ChoiceMode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "sequential" => Ok(Self::Sequential),
            "first" => Ok(Self::First),
            other => Err(ModelError::UnknownVariant {
                field: "choice_mode",
                value: other.to_string(),
            }),
        }
    }
}

/// What happens to source messages after they were republished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AfterPublish {
    #[default]
    Cycle,
    Remove,
}

impl AfterPublish {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cycle => "cycle",
            Self::Remove => "remove",
        }
    }
}

impl std::str::FromStr for AfterPublish {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cycle" => Ok(Self::Cycle),
            "remove" => Ok(Self::Remove),
            other => Err(ModelError::UnknownVariant {
                field: "after_publish",
                value: other.to_string(),
            }),
        }
    }
}

/// Weekly recurrence point: weekday 0 = Monday, offset from local midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeSlot {
    pub weekday: u8,
    pub offset_secs: u32,
}

impl TimeSlot {
    pub const SECONDS_PER_DAY: u32 = 86_400;

    pub fn new(weekday: u8, offset_secs: u32) -> Result<Self, ModelError> {
        if weekday > 6 || offset_secs >= Self::SECONDS_PER_DAY {
            return Err(ModelError::InvalidSlot {
                weekday,
                offset_secs,
            });
        }
        Ok(Self {
            weekday,
            offset_secs,
        })
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
        let day = DAYS.get(self.weekday as usize).copied().unwrap_or("???");
        let h = self.offset_secs / 3600;
        let m = (self.offset_secs % 3600) / 60;
        let s = self.offset_secs % 60;
        write!(f, "{day} {h:02}:{m:02}:{s:02}")
    }
}

/// A recurring republish job from one channel to another
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub bot_id: BotId,
    pub source_id: ChannelId,
    pub target_id: ChannelId,
    pub is_active: bool,
    pub is_global_active: bool,
    pub choice_mode: ChoiceMode,
    pub after_publish: AfterPublish,
    /// Pin the sent message in the target
    #[serde(default)]
    pub pin: bool,
    #[serde(default)]
    pub slots: Vec<TimeSlot>,
}

impl Task {
    /// Both the task flag and the global switch are on
    pub fn is_enabled(&self) -> bool {
        self.is_active && self.is_global_active
    }
}

// ============================================================================
// Channels
// ============================================================================

static TME_LINK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\.)?(?:t|telegram)\.(?:me|dog)/(c/)?([A-Za-z0-9_]+)(?:/(\d+))?/?$")
        .unwrap()
});

static USERNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@?([A-Za-z][A-Za-z0-9_]{3,31})$").unwrap());

/// Logical reference to a channel: numeric id, public username, or both
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ChannelRef {
    pub id: Option<i64>,
    pub username: Option<String>,
}

impl ChannelRef {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            username: None,
        }
    }

    pub fn by_username(username: impl Into<String>) -> Self {
        Self {
            id: None,
            username: Some(username.into()),
        }
    }

    /// Parse a numeric id, `@username`, public `t.me/<name>[/<msg>]`
    /// link or private `t.me/c/<inner>/<msg>` link.
    ///
    /// Private links map to the `-100<inner>` channel id.
    pub fn parse(input: &str) -> Result<Self, ModelError> {
        let s = input.trim();
        if let Ok(id) = s.parse::<i64>() {
            return Ok(Self::by_id(id));
        }

        if let Some(caps) = TME_LINK_REGEX.captures(s) {
            let private = caps.get(1).is_some();
            let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            if private {
                return name
                    .parse::<i64>()
                    .ok()
                    .and_then(|inner| format!("-100{inner}").parse::<i64>().ok())
                    .map(Self::by_id)
                    .ok_or_else(|| ModelError::UnsupportedReference(input.to_string()));
            }
            if name.eq_ignore_ascii_case("joinchat") || !USERNAME_REGEX.is_match(name) {
                return Err(ModelError::UnsupportedReference(input.to_string()));
            }
            return Ok(Self::by_username(name));
        }

        // "@name" or "@name/123"
        let bare = s.split('/').next().unwrap_or_default();
        if bare.starts_with('@') {
            if let Some(caps) = USERNAME_REGEX.captures(bare) {
                return Ok(Self::by_username(&caps[1]));
            }
        }

        Err(ModelError::UnsupportedReference(input.to_string()))
    }

    /// Build from the stored numeric id and optional link of a channel record
    pub fn from_parts(telegram_id: Option<i64>, link: Option<&str>) -> Self {
        let parsed = link
            .filter(|l| !l.trim().is_empty())
            .and_then(|l| Self::parse(l).ok())
            .unwrap_or_default();
        Self {
            id: telegram_id.or(parsed.id),
            username: parsed.username,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.username.is_none()
    }

    /// Stable cache key: id form wins over the link form
    pub fn cache_key(&self) -> String {
        match (&self.id, &self.username) {
            (Some(id), _) => format!("id:{id}"),
            (None, Some(name)) => format!("link:{}", name.to_lowercase()),
            (None, None) => String::from("empty"),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.username) {
            (Some(id), Some(name)) => write!(f, "{id} (@{name})"),
            (Some(id), None) => write!(f, "{id}"),
            (None, Some(name)) => write!(f, "@{name}"),
            (None, None) => write!(f, "<empty>"),
        }
    }
}

/// A source or target channel record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub reference: ChannelRef,
    pub text_suffix: Option<String>,
    pub add_suffix: bool,
}

impl Channel {
    /// Suffix to append to republished content, if enabled and non-empty
    pub fn suffix(&self) -> Option<&str> {
        if !self.add_suffix {
            return None;
        }
        self.text_suffix.as_deref().filter(|s| !s.trim().is_empty())
    }
}

// ============================================================================
// Content
// ============================================================================

/// Formatting entity kind with its payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityKind {
    Bold,
    Italic,
    Underline,
    Strike,
    Spoiler,
    Code,
    Pre { language: Option<String> },
    Blockquote,
    Url,
    TextUrl { url: String },
    Mention,
    MentionName { user_id: i64 },
    Hashtag,
    Cashtag,
    BotCommand,
    Email,
    Phone,
    CustomEmoji { document_id: i64 },
    #[serde(other)]
    Unknown,
}

/// Formatting annotation; offset and length are UTF-16 code units
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(flatten)]
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

impl MessageEntity {
    pub fn new(kind: EntityKind, offset: usize, length: usize) -> Self {
        Self {
            kind,
            offset,
            length,
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Same entity moved `delta` units to the right
    pub fn shifted(&self, delta: usize) -> Self {
        Self {
            offset: self.offset + delta,
            ..self.clone()
        }
    }

    /// Entity restricted to `[0, max)`; `None` when nothing is left
    pub fn clipped(&self, max: usize) -> Option<Self> {
        if self.length == 0 || self.offset >= max {
            return None;
        }
        Some(Self {
            length: self.end().min(max) - self.offset,
            ..self.clone()
        })
    }
}

/// Media attached to a source message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Media {
    Photo {
        file_id: String,
    },
    Document {
        file_id: String,
        mime_type: Option<String>,
        file_name: Option<String>,
    },
    /// Link preview; cannot be re-sent as an attachment
    WebPage {
        url: Option<String>,
    },
    /// Any other attachment forwarded as-is
    Other {
        file_id: String,
    },
}

impl Media {
    pub fn is_web_page(&self) -> bool {
        matches!(self, Self::WebPage { .. })
    }

    pub fn is_image_document(&self) -> bool {
        matches!(
            self,
            Self::Document { mime_type: Some(mime), .. } if mime.to_ascii_lowercase().starts_with("image/")
        )
    }
}

/// One unit of source content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    #[serde(default)]
    pub media: Option<Media>,
    #[serde(default)]
    pub grouped_id: Option<i64>,
    /// Service/action message (joins, pins, title changes)
    #[serde(default)]
    pub is_service: bool,
}

impl RawMessage {
    /// Carries something worth republishing
    pub fn has_content(&self) -> bool {
        !self.is_service && (!self.text.is_empty() || self.media.is_some())
    }

    pub fn had_web_preview(&self) -> bool {
        self.media.as_ref().is_some_and(Media::is_web_page)
    }

    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.date, self.id)
    }
}

/// A single message or an album, members ordered by (date, id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    messages: Vec<RawMessage>,
}

impl Post {
    /// Build a post; `None` for an empty member list
    pub fn new(mut messages: Vec<RawMessage>) -> Option<Self> {
        if messages.is_empty() {
            return None;
        }
        messages.sort_by_key(RawMessage::sort_key);
        Some(Self { messages })
    }

    pub fn messages(&self) -> &[RawMessage] {
        &self.messages
    }

    pub fn first(&self) -> &RawMessage {
        // non-empty by construction
        &self.messages[0]
    }

    pub fn is_album(&self) -> bool {
        self.messages.len() > 1
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.id).collect()
    }

    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        self.first().sort_key()
    }
}
