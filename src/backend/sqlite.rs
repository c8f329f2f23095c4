use super::{topic_for, BackendError, ChangeChannel, ChangeEvent, ChangeHub, NotificationBackend, Subscription};
use crate::model::{NotificationItem, NotificationKind, Payload, PAGE_SIZE};
use crate::storage::{now_millis, Database};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Local backend: notifications live in SQLite and every write is published
/// to the owner's topic on an in-process [`ChangeHub`].
#[derive(Clone)]
pub struct SqliteBackend {
    db: Database,
    hub: ChangeHub,
    feed_topic: String,
}

impl SqliteBackend {
    pub fn new(db: Database, hub: ChangeHub, feed_topic: impl Into<String>) -> Self {
        Self {
            db,
            hub,
            feed_topic: feed_topic.into(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    fn publish(&self, owner_id: &str, event: ChangeEvent) {
        self.hub.publish(&topic_for(&self.feed_topic, owner_id), event);
    }

    /// Create a notification for an owner and publish the insert.
    pub async fn create_notification(
        &self,
        owner_id: &str,
        kind: NotificationKind,
        payload: Payload,
    ) -> Result<NotificationItem, BackendError> {
        let item = NotificationItem {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            read_at: None,
            created_at: now_millis(),
        };
        self.insert_notification(owner_id, item).await
    }

    /// Store a fully-formed notification and publish the insert.
    pub async fn insert_notification(
        &self,
        owner_id: &str,
        item: NotificationItem,
    ) -> Result<NotificationItem, BackendError> {
        self.db
            .insert_notification(owner_id, &item)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))?;
        self.publish(owner_id, ChangeEvent::Insert(item.clone()));
        Ok(item)
    }

    /// Delete a notification and publish the delete. Returns false if absent.
    pub async fn delete_notification(&self, owner_id: &str, item_id: &str) -> Result<bool, BackendError> {
        let removed = self
            .db
            .delete_notification(owner_id, item_id)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))?;
        if removed {
            self.publish(
                owner_id,
                ChangeEvent::Delete {
                    id: item_id.to_string(),
                },
            );
        }
        Ok(removed)
    }
}

#[async_trait]
impl NotificationBackend for SqliteBackend {
    async fn fetch_page(
        &self,
        owner_id: &str,
        cursor: usize,
    ) -> Result<Vec<NotificationItem>, BackendError> {
        let offset = cursor.saturating_mul(PAGE_SIZE) as i64;
        self.db
            .get_notifications_page(owner_id, offset, PAGE_SIZE as i64)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))
    }

    async fn set_read(
        &self,
        owner_id: &str,
        item_id: &str,
        is_read: bool,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let read_at = is_read.then(now_millis);
        let updated = self
            .db
            .set_notification_read(owner_id, item_id, read_at)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))?
            .ok_or_else(|| BackendError::NotFound(item_id.to_string()))?;

        let stored = updated.read_at;
        self.publish(owner_id, ChangeEvent::Update(updated));
        Ok(stored)
    }

    async fn set_all_read(&self, owner_id: &str) -> Result<DateTime<Utc>, BackendError> {
        let can_write = self
            .db
            .owner_can_write(owner_id)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))?;
        if !can_write {
            tracing::warn!(owner = %owner_id, "Bulk read update rejected for read-only owner");
            return Err(BackendError::permission_denied(
                "permission denied for table notifications",
            ));
        }

        let read_at = now_millis();
        let updated = self
            .db
            .mark_all_notifications_read(owner_id, read_at)
            .await
            .map_err(|e| BackendError::Database(e.to_string()))?;
        for item in updated {
            self.publish(owner_id, ChangeEvent::Update(item));
        }
        Ok(read_at)
    }
}

impl ChangeChannel for SqliteBackend {
    fn subscribe(&self, topic: &str) -> Subscription {
        self.hub.subscribe(topic)
    }
}
