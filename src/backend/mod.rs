//! Backing-store contract consumed by the feed cache.
//!
//! The cache never talks to a database or a server directly. It goes through
//! two seams:
//!
//! - [`NotificationBackend`] - paged fetches and read-state writes
//! - [`ChangeChannel`] - per-owner push subscriptions delivering [`ChangeEvent`]s
//!
//! Two implementations ship with the crate:
//!
//! - [`SqliteBackend`] - local SQLite store that publishes its own writes to a [`ChangeHub`]
//! - [`HttpBackend`] - REST client for a hosted backend

mod http;
mod hub;
mod sqlite;

pub use http::HttpBackend;
pub use hub::ChangeHub;
pub use sqlite::SqliteBackend;

use crate::model::NotificationItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error code the backend uses for "permission denied" on bulk updates.
pub const PERMISSION_DENIED_CODE: &str = "42501";

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by a backing store.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with non-2xx status code and no structured body
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Structured error reported by the backend
    #[error("{message}")]
    Api {
        code: Option<String>,
        message: String,
    },
    /// Notification does not exist for this owner
    #[error("Notification {0} not found")]
    NotFound(String),
    /// Local store failure
    #[error("Database error: {0}")]
    Database(String),
    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Backend base URL is malformed or insecure
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl BackendError {
    /// True if the backend reported the designated permission-denied code.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, BackendError::Api { code: Some(code), .. } if code == PERMISSION_DENIED_CODE)
    }

    pub(crate) fn permission_denied(message: impl Into<String>) -> Self {
        BackendError::Api {
            code: Some(PERMISSION_DENIED_CODE.to_string()),
            message: message.into(),
        }
    }
}

// ============================================================================
// Backend Contract
// ============================================================================

/// Paged reads and read-state writes against the authoritative store.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Up to `PAGE_SIZE` items for page `cursor`, ordered by `created_at` descending.
    async fn fetch_page(
        &self,
        owner_id: &str,
        cursor: usize,
    ) -> Result<Vec<NotificationItem>, BackendError>;

    /// Set or clear the read mark on one item. Returns the stored `read_at`.
    async fn set_read(
        &self,
        owner_id: &str,
        item_id: &str,
        is_read: bool,
    ) -> Result<Option<DateTime<Utc>>, BackendError>;

    /// Mark every unread item of the owner read. Returns the shared `read_at`.
    async fn set_all_read(&self, owner_id: &str) -> Result<DateTime<Utc>, BackendError>;
}

// ============================================================================
// Push Channel
// ============================================================================

/// Row-level change delivered by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(NotificationItem),
    Update(NotificationItem),
    Delete { id: String },
}

impl ChangeEvent {
    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Insert(item) | ChangeEvent::Update(item) => &item.id,
            ChangeEvent::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert(_) => "insert",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }
}

/// Topic a feed subscribes to: `<feed_topic>:<owner_id>`.
pub fn topic_for(feed_topic: &str, owner_id: &str) -> String {
    format!("{feed_topic}:{owner_id}")
}

/// Source of per-owner push subscriptions.
pub trait ChangeChannel: Send + Sync {
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// A live push subscription.
///
/// Releasing happens exactly once: on [`Subscription::unsubscribe`] or on drop,
/// whichever comes first.
pub struct Subscription {
    topic: String,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            events,
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the channel side has gone away.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::debug!(topic = %self.topic, "Releasing subscription");
            self.events.close();
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("released", &self.release.is_none())
            .finish()
    }
}
