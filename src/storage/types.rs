use crate::model::{NotificationItem, NotificationKind, Payload};
use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The notification database is locked by another process. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// one of these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for notification queries (used by sqlx FromRow).
///
/// Timestamps are stored as Unix milliseconds so ordering by `created_at`
/// stays exact without string comparison.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct NotificationRow {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

impl NotificationRow {
    pub(crate) fn into_item(self) -> NotificationItem {
        let payload = match serde_json::from_str::<Payload>(&self.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "Stored payload is not a JSON object, using empty payload");
                Payload::default()
            }
        };

        NotificationItem {
            id: self.id,
            kind: NotificationKind::from(self.kind),
            payload,
            read_at: self.read_at.and_then(DateTime::from_timestamp_millis),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

/// Current time truncated to the millisecond precision the store keeps.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
