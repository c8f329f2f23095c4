//! Wires the cache, reconciler, change bridge and backend together for the
//! signed-in owner.

use crate::backend::{ChangeChannel, NotificationBackend};
use crate::bridge::ChangeBridge;
use crate::cache::{FeedKey, QueryCache, Reconciler, ReconcilerHandle};
use crate::mutations::ReadMutations;
use crate::store::FeedStore;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

/// Settings for a [`NotificationCenter`].
#[derive(Debug, Clone)]
pub struct CenterOptions {
    pub feed_topic: String,
    pub reconcile_debounce: Duration,
    pub max_cached_owners: NonZeroUsize,
}

impl Default for CenterOptions {
    fn default() -> Self {
        Self {
            feed_topic: "notifications".to_string(),
            reconcile_debounce: Duration::from_millis(50),
            max_cached_owners: NonZeroUsize::new(8).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// One owner's notification feed, kept in sync with the backend.
///
/// Hands out [`FeedStore`] and [`ReadMutations`] views bound to the current
/// owner. Changing the owner discards the previous owner's cache entry and
/// moves the push subscription.
pub struct NotificationCenter {
    cache: QueryCache,
    backend: Arc<dyn NotificationBackend>,
    bridge: ChangeBridge,
    reconciler: ReconcilerHandle,
    owner_id: Option<String>,
}

impl NotificationCenter {
    /// Must be called inside a tokio runtime; spawns the reconciler task.
    pub fn new(
        backend: Arc<dyn NotificationBackend>,
        channel: Arc<dyn ChangeChannel>,
        options: CenterOptions,
    ) -> Self {
        let cache = QueryCache::new(options.max_cached_owners);
        let reconciler = Reconciler::new(cache.clone(), backend.clone())
            .with_debounce(options.reconcile_debounce)
            .spawn();
        let bridge = ChangeBridge::new(cache.clone(), channel, options.feed_topic);
        Self {
            cache,
            backend,
            bridge,
            reconciler,
            owner_id: None,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn reconciler(&self) -> &ReconcilerHandle {
        &self.reconciler
    }

    /// Switch to another owner, or to none on sign-out.
    ///
    /// Setting the same owner again keeps its cache and only reopens the push
    /// subscription if that one has stopped.
    pub async fn set_owner(&mut self, owner_id: Option<&str>) {
        if self.owner_id.as_deref() != owner_id {
            if let Some(previous) = self.owner_id.take() {
                self.cache.remove(&FeedKey::notifications(&previous));
                tracing::info!(owner = %previous, "Discarded notification cache for previous owner");
            }
            self.owner_id = owner_id.map(str::to_string);
        }
        self.bridge.set_owner(owner_id).await;
    }

    pub fn feed(&self) -> FeedStore {
        FeedStore::new(self.cache.clone(), self.backend.clone(), self.owner_id.as_deref())
    }

    pub fn mutations(&self) -> ReadMutations {
        ReadMutations::new(self.cache.clone(), self.backend.clone(), self.owner_id.as_deref())
    }

    /// Drop the current owner and wait for the push subscription to close.
    pub async fn shutdown(&mut self) {
        self.set_owner(None).await;
    }
}
