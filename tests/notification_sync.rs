//! End-to-end tests for the notification session over the local backend.
//!
//! Each test opens its own in-memory SQLite database. Writes go through
//! `SqliteBackend`, which publishes every change on an in-process hub, so the
//! push path, the reconciler and the mutations all run for real.

use chrono::{DateTime, Utc};
use notifeed::backend::{topic_for, ChangeHub, SqliteBackend};
use notifeed::cache::{FeedCache, FeedKey};
use notifeed::error::PERMISSION_DENIED_MESSAGE;
use notifeed::model::{NotificationItem, NotificationKind, Payload, PAGE_SIZE};
use notifeed::storage::Database;
use notifeed::{view, CenterOptions, FeedError, NotificationCenter};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "notifications";
const WAIT: Duration = Duration::from_secs(5);

async fn test_backend() -> SqliteBackend {
    let db = Database::open(":memory:").await.unwrap();
    SqliteBackend::new(db, ChangeHub::new(), TOPIC)
}

fn options() -> CenterOptions {
    CenterOptions {
        reconcile_debounce: Duration::ZERO,
        ..CenterOptions::default()
    }
}

fn center(backend: &SqliteBackend) -> NotificationCenter {
    NotificationCenter::new(Arc::new(backend.clone()), Arc::new(backend.clone()), options())
}

fn item(id: &str, secs: i64) -> NotificationItem {
    NotificationItem {
        id: id.to_string(),
        kind: NotificationKind::from("system"),
        payload: Payload::default(),
        read_at: None,
        created_at: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
    }
}

fn ids(items: &[Arc<NotificationItem>]) -> Vec<String> {
    items.iter().map(|n| n.id.clone()).collect()
}

/// Poll until `check` holds; the reconciler and the bridge run on their own tasks.
async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn seed(backend: &SqliteBackend, owner: &str, count: usize) {
    for i in 0..count {
        backend
            .insert_notification(owner, item(&format!("{owner}-{i:02}"), 1_000_000 - i as i64))
            .await
            .unwrap();
    }
}

// ============================================================================
// Pagination
// ============================================================================

#[tokio::test]
async fn test_pages_through_feed_to_terminal() {
    let backend = test_backend().await;
    seed(&backend, "alice", PAGE_SIZE * 2 + 3).await;
    let mut center = center(&backend);
    center.set_owner(Some("alice")).await;

    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();
    while feed.has_next_page() {
        feed.fetch_next_page().await.unwrap();
    }

    let items = feed.items();
    assert_eq!(items.len(), PAGE_SIZE * 2 + 3);
    assert_eq!(items[0].id, "alice-00");
    assert!(items.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    assert!(feed.fetch_more().await.unwrap().is_empty());

    center.shutdown().await;
}

// ============================================================================
// Push Events
// ============================================================================

#[tokio::test]
async fn test_insert_on_full_page_keeps_page_bounded() {
    let backend = test_backend().await;
    seed(&backend, "alice", PAGE_SIZE).await;
    let mut center = center(&backend);
    center.set_owner(Some("alice")).await;
    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();
    let dropped = feed.items()[PAGE_SIZE - 1].id.clone();

    backend
        .insert_notification("alice", item("fresh", 2_000_000))
        .await
        .unwrap();

    eventually(|| feed.items().first().is_some_and(|n| n.id == "fresh")).await;
    let key = FeedKey::notifications("alice");
    let first_page = center.cache().read(&key, |f| f.pages()[0].clone()).unwrap();
    assert_eq!(first_page.len(), PAGE_SIZE);

    // The reconciler's refetch lands on the same window
    center.reconciler().wait_for_refetches(1).await;
    eventually(|| !center.cache().read(&key, FeedCache::is_stale).unwrap_or(true)).await;
    let items = feed.items();
    assert_eq!(items.len(), PAGE_SIZE);
    assert_eq!(items[0].id, "fresh");
    assert!(items.iter().all(|n| n.id != dropped));
    assert!(feed.has_next_page());

    center.shutdown().await;
}

#[tokio::test]
async fn test_delete_event_removes_item() {
    let backend = test_backend().await;
    seed(&backend, "alice", 3).await;
    let mut center = center(&backend);
    center.set_owner(Some("alice")).await;
    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();

    assert!(backend.delete_notification("alice", "alice-01").await.unwrap());

    eventually(|| feed.items().len() == 2).await;
    assert_eq!(ids(&feed.items()), vec!["alice-00", "alice-02"]);

    center.shutdown().await;
}

#[tokio::test]
async fn test_events_for_other_owner_are_not_applied() {
    let backend = test_backend().await;
    seed(&backend, "alice", 2).await;
    let mut center = center(&backend);
    center.set_owner(Some("alice")).await;
    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();

    backend.insert_notification("bob", item("bob-x", 9_000_000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(ids(&feed.items()), vec!["alice-00", "alice-01"]);
    center.shutdown().await;
}

// ============================================================================
// Owner Switching
// ============================================================================

#[tokio::test]
async fn test_owner_switch_moves_subscription_and_discards_cache() {
    let backend = test_backend().await;
    seed(&backend, "alice", 2).await;
    seed(&backend, "bob", 1).await;
    let hub = backend.hub().clone();
    let mut center = center(&backend);

    center.set_owner(Some("alice")).await;
    center.feed().fetch_first_page().await.unwrap();
    assert_eq!(hub.subscriber_count(&topic_for(TOPIC, "alice")), 1);

    // Same owner again keeps the single subscription
    center.set_owner(Some("alice")).await;
    assert_eq!(hub.subscriber_count(&topic_for(TOPIC, "alice")), 1);

    center.set_owner(Some("bob")).await;
    assert_eq!(hub.subscriber_count(&topic_for(TOPIC, "alice")), 0);
    assert_eq!(hub.subscriber_count(&topic_for(TOPIC, "bob")), 1);
    assert!(!center.cache().contains(&FeedKey::notifications("alice")));

    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();
    assert_eq!(ids(&feed.items()), vec!["bob-00"]);

    center.set_owner(None).await;
    assert_eq!(hub.subscriber_count(&topic_for(TOPIC, "bob")), 0);
    assert!(center.feed().items().is_empty());
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_set_read_round_trips_through_backend() {
    let backend = test_backend().await;
    seed(&backend, "alice", 3).await;
    let mut center = center(&backend);
    center.set_owner(Some("alice")).await;
    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();
    assert_eq!(view::count_unread(feed.items()), 3);

    let read_at = center.mutations().set_read("alice-01", true).await.unwrap();
    assert!(read_at.is_some());
    assert_eq!(view::count_unread(feed.items()), 2);

    center.reconciler().wait_for_refetches(1).await;
    let stored = backend.database().count_unread_notifications("alice").await.unwrap();
    assert_eq!(stored, 2);
    eventually(|| view::count_unread(feed.items()) == 2).await;

    center.shutdown().await;
}

#[tokio::test]
async fn test_mark_all_read_clears_unread() {
    let backend = test_backend().await;
    seed(&backend, "alice", 4).await;
    let mut center = center(&backend);
    center.set_owner(Some("alice")).await;
    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();

    center.mutations().mark_all_read().await.unwrap();
    assert_eq!(view::count_unread(feed.items()), 0);

    center.reconciler().wait_for_refetches(1).await;
    assert_eq!(
        backend.database().count_unread_notifications("alice").await.unwrap(),
        0
    );
    center.shutdown().await;
}

#[tokio::test]
async fn test_mark_all_read_permission_denied_recovers_via_refetch() {
    let backend = test_backend().await;
    backend.database().upsert_owner("alice", false).await.unwrap();
    seed(&backend, "alice", 3).await;
    let mut center = center(&backend);
    center.set_owner(Some("alice")).await;
    let feed = center.feed();
    feed.fetch_first_page().await.unwrap();

    let mutations = center.mutations();
    let err = mutations.mark_all_read().await.unwrap_err();
    assert!(matches!(err, FeedError::PermissionDenied));
    assert_eq!(err.to_string(), PERMISSION_DENIED_MESSAGE);
    assert_eq!(
        mutations.state().mark_all_error.as_deref(),
        Some(PERMISSION_DENIED_MESSAGE)
    );

    // The optimistic patch is not rolled back locally; the refetch restores it
    eventually(|| view::count_unread(feed.items()) == 3).await;
    center.shutdown().await;
}

#[tokio::test]
async fn test_mutations_without_owner_fail_fast() {
    let backend = test_backend().await;
    let center = center(&backend);

    let mutations = center.mutations();
    assert!(matches!(mutations.mark_all_read().await, Err(FeedError::MissingOwner)));
    assert!(matches!(
        mutations.set_read("anything", true).await,
        Err(FeedError::MissingOwner)
    ));
}
