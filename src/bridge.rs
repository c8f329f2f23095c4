//! Change-event bridge: applies push events straight into the feed cache.
//!
//! Events are patched in synchronously under the cache lock; the backend is
//! never consulted. Inserts and deletes can shift page boundaries, so they
//! also invalidate the entry and let the reconciler repair the window. An
//! update replaces one item by id and is trusted as-is.
//!
//! The bridge owns at most one subscription. Switching owners releases the
//! old subscription and waits for its pump task to finish before the new one
//! is opened, so no event is ever delivered twice.

use crate::backend::{topic_for, ChangeChannel, ChangeEvent, Subscription};
use crate::cache::{FeedCache, FeedKey, QueryCache};
use crate::model::{NotificationItem, PAGE_SIZE};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// ============================================================================
// Applying Events
// ============================================================================

/// What applying one event did to a feed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeOutcome {
    /// The held pages were modified.
    pub changed: bool,
    /// The entry should be refetched.
    pub reconcile: bool,
}

/// Apply one push event to a feed cache.
pub fn apply_change(feed: &mut FeedCache, event: &ChangeEvent) -> ChangeOutcome {
    match event {
        ChangeEvent::Insert(item) => ChangeOutcome {
            changed: apply_insert(feed, item),
            reconcile: true,
        },
        ChangeEvent::Update(item) => ChangeOutcome {
            changed: replace_item(feed, item),
            reconcile: false,
        },
        ChangeEvent::Delete { id } => ChangeOutcome {
            changed: remove_item(feed, id),
            reconcile: true,
        },
    }
}

/// Prepend to page 0, dropping the tail entry if the page overflows.
///
/// With no pages held there is nothing to anchor to, so the insert is
/// ignored. An id that is already held is replaced in place instead of
/// being inserted a second time.
fn apply_insert(feed: &mut FeedCache, item: &NotificationItem) -> bool {
    if feed.page_count() == 0 {
        return false;
    }
    if replace_item(feed, item) {
        tracing::debug!(id = %item.id, "Insert for held id applied as replacement");
        return true;
    }

    let Some(first) = feed.pages_mut().first_mut() else {
        return false;
    };
    first.insert(0, Arc::new(item.clone()));
    if first.len() > PAGE_SIZE {
        first.truncate(PAGE_SIZE);
    }
    true
}

fn replace_item(feed: &mut FeedCache, item: &NotificationItem) -> bool {
    for page in feed.pages_mut().iter_mut() {
        if let Some(slot) = page.iter_mut().find(|held| held.id == item.id) {
            *slot = Arc::new(item.clone());
            return true;
        }
    }
    false
}

fn remove_item(feed: &mut FeedCache, id: &str) -> bool {
    for page in feed.pages_mut().iter_mut() {
        if let Some(pos) = page.iter().position(|held| held.id == id) {
            page.remove(pos);
            return true;
        }
    }
    false
}

/// Apply an event to the cache entry for `key` and schedule reconciliation
/// when the event kind calls for it.
pub fn deliver(cache: &QueryCache, key: &FeedKey, event: &ChangeEvent) -> ChangeOutcome {
    let outcome = cache.update(key, |feed| apply_change(feed, event)).unwrap_or(ChangeOutcome {
        changed: false,
        reconcile: !matches!(event, ChangeEvent::Update(_)),
    });

    tracing::debug!(
        key = %key,
        event = event.kind(),
        id = %event.id(),
        changed = outcome.changed,
        "Applied change event"
    );

    if outcome.reconcile {
        cache.invalidate(key);
    }
    outcome
}

// ============================================================================
// Subscription Lifecycle
// ============================================================================

struct ActiveSubscription {
    owner_id: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Keeps one push subscription open for the current owner and pumps its
/// events into the cache.
pub struct ChangeBridge {
    cache: QueryCache,
    channel: Arc<dyn ChangeChannel>,
    feed_topic: String,
    active: Option<ActiveSubscription>,
}

impl ChangeBridge {
    pub fn new(cache: QueryCache, channel: Arc<dyn ChangeChannel>, feed_topic: impl Into<String>) -> Self {
        Self {
            cache,
            channel,
            feed_topic: feed_topic.into(),
            active: None,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.owner_id.as_str())
    }

    /// Follow a new owner.
    ///
    /// The same owner keeps its subscription while its pump is running; a
    /// pump that stopped because the push channel closed is replaced. A
    /// different owner (or `None`) tears the current one down completely
    /// before anything new is opened.
    pub async fn set_owner(&mut self, owner_id: Option<&str>) {
        match (&self.active, owner_id) {
            (None, None) => return,
            (Some(active), Some(owner_id)) if active.owner_id == owner_id => {
                if !active.task.is_finished() {
                    return;
                }
                tracing::info!(owner = %owner_id, "Change bridge pump stopped, subscribing again");
            }
            _ => {}
        }
        self.shutdown().await;

        let Some(owner_id) = owner_id else {
            return;
        };

        let topic = topic_for(&self.feed_topic, owner_id);
        let subscription = self.channel.subscribe(&topic);
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(pump(
            subscription,
            self.cache.clone(),
            FeedKey::notifications(owner_id),
            stopped,
        ));
        tracing::info!(owner = %owner_id, topic = %topic, "Change bridge subscribed");

        self.active = Some(ActiveSubscription {
            owner_id: owner_id.to_string(),
            stop,
            task,
        });
    }

    /// Release the current subscription and wait for its pump to exit.
    pub async fn shutdown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let _ = active.stop.send(());
        if let Err(e) = active.task.await {
            tracing::warn!(owner = %active.owner_id, error = %e, "Change bridge task ended abnormally");
        }
        tracing::info!(owner = %active.owner_id, "Change bridge unsubscribed");
    }
}

impl Drop for ChangeBridge {
    fn drop(&mut self) {
        // Aborting drops the pump future, and with it the subscription.
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

async fn pump(
    mut subscription: Subscription,
    cache: QueryCache,
    key: FeedKey,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut stop => break,

            event = subscription.recv() => match event {
                Some(event) => {
                    deliver(&cache, &key, &event);
                }
                None => {
                    tracing::warn!(key = %key, "Push channel closed, cache will only heal on refetch");
                    break;
                }
            },
        }
    }
    subscription.unsubscribe();
}
