//! Notification data shapes shared by every layer of the feed cache.
//!
//! Items arrive from the backing store already ordered by `created_at`
//! descending. Nothing in this module sorts; it only describes the shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Maximum number of items in one page, and the size the backend pages by.
pub const PAGE_SIZE: usize = 20;

/// Wire tag for mention notifications.
pub const MENTION_KIND: &str = "mention";

/// One page of the feed. Items are `Arc`-wrapped so patches can swap a single
/// entry and leave every sibling pointer-identical.
pub type FeedPage = Vec<Arc<NotificationItem>>;

// ============================================================================
// Notification Kind
// ============================================================================

/// Type tag of a notification.
///
/// Known tags get their own variant; anything else is carried verbatim in
/// `Other` so unknown server-side kinds survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    Mention,
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::Mention => MENTION_KIND,
            NotificationKind::Other(tag) => tag,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(tag: String) -> Self {
        if tag == MENTION_KIND {
            NotificationKind::Mention
        } else {
            NotificationKind::Other(tag)
        }
    }
}

impl From<&str> for NotificationKind {
    fn from(tag: &str) -> Self {
        NotificationKind::from(tag.to_string())
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Mention => MENTION_KIND.to_string(),
            NotificationKind::Other(tag) => tag,
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Open key/value payload attached to a notification.
///
/// Field access goes through the accessors below rather than ad hoc map
/// lookups, so the set of fields the cache understands lives in one place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

/// Mention-specific fields: where in the product the mention happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionTarget {
    pub prompt_id: String,
    pub thread_id: Option<String>,
    pub comment_id: Option<String>,
}

impl Payload {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Returns the field if it is a non-empty string.
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.text("title")
    }

    pub fn message(&self) -> Option<&str> {
        self.text("message")
    }

    pub fn body(&self) -> Option<&str> {
        self.text("body")
    }

    /// Mention fields, present only when `prompt_id` is a non-empty string.
    pub fn mention_target(&self) -> Option<MentionTarget> {
        let prompt_id = self.text("prompt_id")?;
        Some(MentionTarget {
            prompt_id: prompt_id.to_string(),
            thread_id: self.text("thread_id").map(str::to_string),
            comment_id: self.text("comment_id").map(str::to_string),
        })
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

// ============================================================================
// Notification Item
// ============================================================================

/// A single notification as delivered by the backend or the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NotificationItem {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }

    /// Copy of this item with `read_at` replaced.
    pub fn with_read_at(&self, read_at: Option<DateTime<Utc>>) -> Self {
        Self {
            read_at,
            ..self.clone()
        }
    }
}

// Lets view helpers accept owned items, references and `Arc`s alike.
impl AsRef<NotificationItem> for NotificationItem {
    fn as_ref(&self) -> &NotificationItem {
        self
    }
}
