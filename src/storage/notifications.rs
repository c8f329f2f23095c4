use anyhow::Result;
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::NotificationRow;
use crate::model::NotificationItem;

/// Maximum number of notifications any single page query may return
const MAX_PAGE_LIMIT: i64 = 200;

impl Database {
    // ========================================================================
    // Owner Operations
    // ========================================================================

    /// Register an owner, or update its write permission if it exists.
    pub async fn upsert_owner(&self, owner_id: &str, can_write: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owners (id, can_write)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET can_write = excluded.can_write
        "#,
        )
        .bind(owner_id)
        .bind(can_write)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the owner may bulk-update its own feed. Unknown owners may.
    pub async fn owner_can_write(&self, owner_id: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT can_write FROM owners WHERE id = ?")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(can_write,)| can_write).unwrap_or(true))
    }

    // ========================================================================
    // Notification Writes
    // ========================================================================

    /// Insert a notification for an owner. Fails on duplicate id.
    pub async fn insert_notification(&self, owner_id: &str, item: &NotificationItem) -> Result<()> {
        let payload = serde_json::to_string(&item.payload)?;
        sqlx::query(
            r#"
            INSERT INTO notifications (id, owner_id, kind, payload, read_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&item.id)
        .bind(owner_id)
        .bind(item.kind.as_str())
        .bind(payload)
        .bind(item.read_at.map(|t| t.timestamp_millis()))
        .bind(item.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set or clear `read_at` on one notification.
    ///
    /// Returns the updated row, or `None` if the owner has no such notification.
    pub async fn set_notification_read(
        &self,
        owner_id: &str,
        notification_id: &str,
        read_at: Option<DateTime<Utc>>,
    ) -> Result<Option<NotificationItem>> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE notifications SET read_at = ? WHERE id = ? AND owner_id = ?")
            .bind(read_at.map(|t| t.timestamp_millis()))
            .bind(notification_id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, kind, payload, read_at, created_at
            FROM notifications
            WHERE id = ?
        "#,
        )
        .bind(notification_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.map(NotificationRow::into_item))
    }

    /// Stamp every unread notification of an owner with one `read_at`.
    ///
    /// Returns the rows that changed so callers can publish one update per row.
    pub async fn mark_all_notifications_read(
        &self,
        owner_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<Vec<NotificationItem>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM notifications WHERE owner_id = ? AND read_at IS NULL")
                .bind(owner_id)
                .fetch_all(&mut *tx)
                .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        sqlx::query("UPDATE notifications SET read_at = ? WHERE owner_id = ? AND read_at IS NULL")
            .bind(read_at.timestamp_millis())
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;

        let mut updated = Vec::with_capacity(ids.len());
        for (id,) in &ids {
            let row = sqlx::query_as::<_, NotificationRow>(
                "SELECT id, kind, payload, read_at, created_at FROM notifications WHERE id = ?",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            updated.push(row.into_item());
        }

        tx.commit().await?;
        tracing::debug!(owner = %owner_id, count = updated.len(), "Marked notifications read");
        Ok(updated)
    }

    /// Delete one notification. Returns true if a row was removed.
    pub async fn delete_notification(&self, owner_id: &str, notification_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ? AND owner_id = ?")
            .bind(notification_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Notification Queries
    // ========================================================================

    /// One page of an owner's notifications, newest first.
    ///
    /// Rows created in the same millisecond fall back to insertion order so
    /// consecutive pages never overlap.
    ///
    /// `limit` is capped at `MAX_PAGE_LIMIT`.
    pub async fn get_notifications_page(
        &self,
        owner_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<NotificationItem>> {
        let limit = limit.clamp(0, MAX_PAGE_LIMIT);
        let rows = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, kind, payload, read_at, created_at
            FROM notifications
            WHERE owner_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
        "#,
        )
        .bind(owner_id)
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(NotificationRow::into_item).collect())
    }

    /// Number of unread notifications for an owner.
    pub async fn count_unread_notifications(&self, owner_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE owner_id = ? AND read_at IS NULL",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{NotificationItem, NotificationKind, Payload};
    use crate::storage::Database;
    use chrono::{DateTime, Utc};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn item(id: &str, created_ms: i64) -> NotificationItem {
        NotificationItem {
            id: id.to_string(),
            kind: NotificationKind::Other("system".to_string()),
            payload: Payload::default(),
            read_at: None,
            created_at: DateTime::from_timestamp_millis(created_ms).unwrap(),
        }
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[tokio::test]
    async fn test_page_is_newest_first_and_owner_scoped() {
        let db = test_db().await;
        db.insert_notification("alice", &item("a1", 1_000)).await.unwrap();
        db.insert_notification("alice", &item("a2", 3_000)).await.unwrap();
        db.insert_notification("alice", &item("a3", 2_000)).await.unwrap();
        db.insert_notification("bob", &item("b1", 9_000)).await.unwrap();

        let page = db.get_notifications_page("alice", 0, 20).await.unwrap();
        let ids: Vec<_> = page.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a3", "a1"]);
    }

    #[tokio::test]
    async fn test_page_offset_and_limit() {
        let db = test_db().await;
        for i in 0..5 {
            db.insert_notification("alice", &item(&format!("n{i}"), i * 100))
                .await
                .unwrap();
        }

        let second = db.get_notifications_page("alice", 2, 2).await.unwrap();
        let ids: Vec<_> = second.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
    }

    #[tokio::test]
    async fn test_set_read_round_trip() {
        let db = test_db().await;
        db.insert_notification("alice", &item("a1", 1_000)).await.unwrap();

        let updated = db
            .set_notification_read("alice", "a1", Some(ts(5_000)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.read_at, Some(ts(5_000)));
        assert_eq!(db.count_unread_notifications("alice").await.unwrap(), 0);

        let cleared = db
            .set_notification_read("alice", "a1", None)
            .await
            .unwrap()
            .unwrap();
        assert!(cleared.read_at.is_none());
    }

    #[tokio::test]
    async fn test_set_read_other_owner_is_none() {
        let db = test_db().await;
        db.insert_notification("alice", &item("a1", 1_000)).await.unwrap();

        let result = db
            .set_notification_read("mallory", "a1", Some(ts(5_000)))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(db.count_unread_notifications("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_all_read_returns_changed_rows_only() {
        let db = test_db().await;
        db.insert_notification("alice", &item("a1", 1_000)).await.unwrap();
        let mut already = item("a2", 2_000);
        already.read_at = Some(ts(1_500));
        db.insert_notification("alice", &already).await.unwrap();

        let changed = db
            .mark_all_notifications_read("alice", ts(9_000))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "a1");
        assert_eq!(changed[0].read_at, Some(ts(9_000)));

        let again = db
            .mark_all_notifications_read("alice", ts(10_000))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_owner_permissions_default_to_writable() {
        let db = test_db().await;
        assert!(db.owner_can_write("new-owner").await.unwrap());

        db.upsert_owner("viewer", false).await.unwrap();
        assert!(!db.owner_can_write("viewer").await.unwrap());

        db.upsert_owner("viewer", true).await.unwrap();
        assert!(db.owner_can_write("viewer").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_notification() {
        let db = test_db().await;
        db.insert_notification("alice", &item("a1", 1_000)).await.unwrap();

        assert!(!db.delete_notification("bob", "a1").await.unwrap());
        assert!(db.delete_notification("alice", "a1").await.unwrap());
        assert!(db.get_notifications_page("alice", 0, 20).await.unwrap().is_empty());
    }
}
