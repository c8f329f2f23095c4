//! Paginated feed store: the read side of one owner's notification feed.
//!
//! `FeedStore` drives paged fetches into the shared [`QueryCache`] entry for
//! its owner and exposes the flattened view the UI renders. It never sorts;
//! ordering comes from the backend. A failed fetch leaves held pages alone.

use crate::backend::NotificationBackend;
use crate::cache::{refetch_window, FeedCache, FeedKey, QueryCache, RefetchOutcome};
use crate::error::FeedError;
use crate::model::NotificationItem;
use std::sync::{Arc, Mutex, MutexGuard};

/// Snapshot of a feed for rendering.
#[derive(Debug, Clone, Default)]
pub struct FeedState {
    pub items: Vec<Arc<NotificationItem>>,
    pub has_more: bool,
    /// First page requested and nothing held yet
    pub is_loading: bool,
    /// Most recent fetch failed
    pub is_error: bool,
}

#[derive(Debug, Default)]
struct FetchStatus {
    loading_first: bool,
    last_error: Option<String>,
}

/// Read side of one owner's feed.
#[derive(Clone)]
pub struct FeedStore {
    cache: QueryCache,
    backend: Arc<dyn NotificationBackend>,
    key: Option<FeedKey>,
    status: Arc<Mutex<FetchStatus>>,
}

impl FeedStore {
    /// Store for `owner_id`. With no owner every fetch is an empty no-op.
    pub fn new(cache: QueryCache, backend: Arc<dyn NotificationBackend>, owner_id: Option<&str>) -> Self {
        Self {
            cache,
            backend,
            key: owner_id.map(FeedKey::notifications),
            status: Arc::new(Mutex::new(FetchStatus::default())),
        }
    }

    pub fn key(&self) -> Option<&FeedKey> {
        self.key.as_ref()
    }

    fn status(&self) -> MutexGuard<'_, FetchStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the feed from the top, creating the cache entry on first use.
    ///
    /// An entry that already holds several pages has all of them reloaded,
    /// so items pushed down from page 0 stay visible on page 1. Returns the
    /// items of page 0.
    pub async fn fetch_first_page(&self) -> Result<Vec<Arc<NotificationItem>>, FeedError> {
        let Some(key) = self.key.clone() else {
            return Ok(Vec::new());
        };
        self.cache.ensure(&key);
        self.status().loading_first = true;
        let result = refetch_window(&self.cache, self.backend.as_ref(), &key).await;
        self.status().loading_first = false;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "First page fetch failed");
                self.status().last_error = Some(e.to_string());
                return Err(FeedError::Backend(e));
            }
        };
        self.status().last_error = None;

        match outcome {
            RefetchOutcome::Applied => tracing::debug!(key = %key, "Loaded feed from the top"),
            RefetchOutcome::Superseded => {
                tracing::debug!(key = %key, "Feed changed while loading, keeping held pages");
                self.cache.invalidate(&key);
            }
            RefetchOutcome::Discarded => {
                tracing::debug!(key = %key, "Feed cache discarded while fetching, pages dropped");
                return Ok(Vec::new());
            }
        }
        Ok(self
            .cache
            .read(&key, |feed| feed.pages().first().cloned())
            .flatten()
            .unwrap_or_default())
    }

    /// Fetch the page after the last one held.
    ///
    /// Empty when there is no owner or the feed is terminal.
    pub async fn fetch_next_page(&self) -> Result<Vec<Arc<NotificationItem>>, FeedError> {
        let Some(key) = self.key.clone() else {
            return Ok(Vec::new());
        };
        self.cache.ensure(&key);
        let Some(cursor) = self.cache.read(&key, FeedCache::next_cursor).flatten() else {
            tracing::debug!(key = %key, "Feed is terminal, no next page");
            return Ok(Vec::new());
        };
        self.fetch_into(&key, cursor).await
    }

    /// Alias of [`FeedStore::fetch_next_page`] matching the UI surface.
    pub async fn fetch_more(&self) -> Result<Vec<Arc<NotificationItem>>, FeedError> {
        self.fetch_next_page().await
    }

    async fn fetch_into(&self, key: &FeedKey, cursor: usize) -> Result<Vec<Arc<NotificationItem>>, FeedError> {
        let generation = self.cache.ensure(key);
        let revision = self.cache.read(key, FeedCache::revision).unwrap_or(0);

        match self.backend.fetch_page(key.owner_id(), cursor).await {
            Ok(page) => {
                self.status().last_error = None;
                let stored = self.cache.update_if_current(key, generation, |feed| {
                    let overtaken = feed.revision() != revision;
                    feed.store_page(cursor, page)
                        .then(|| (feed.pages()[cursor].clone(), overtaken))
                });
                match stored {
                    Some(Some((items, overtaken))) => {
                        tracing::debug!(key = %key, cursor, count = items.len(), "Stored feed page");
                        if overtaken {
                            // Held pages changed mid-fetch; this page may predate that change.
                            self.cache.invalidate(key);
                        }
                        Ok(items)
                    }
                    Some(None) => {
                        tracing::debug!(key = %key, cursor, "Page no longer adjacent to held pages, dropped");
                        Ok(Vec::new())
                    }
                    None => {
                        tracing::debug!(key = %key, cursor, "Feed cache discarded while fetching, page dropped");
                        Ok(Vec::new())
                    }
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, cursor, error = %e, "Feed page fetch failed");
                self.status().last_error = Some(e.to_string());
                Err(FeedError::Backend(e))
            }
        }
    }

    pub fn has_next_page(&self) -> bool {
        self.key
            .as_ref()
            .and_then(|key| self.cache.read(key, FeedCache::has_next_page))
            .unwrap_or(false)
    }

    /// Flattened items in page order, re-derived from the cache on every call.
    pub fn items(&self) -> Vec<Arc<NotificationItem>> {
        self.key
            .as_ref()
            .and_then(|key| self.cache.read(key, |feed| feed.iter().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn is_loading(&self) -> bool {
        let held = self
            .key
            .as_ref()
            .and_then(|key| self.cache.read(key, FeedCache::page_count))
            .unwrap_or(0);
        self.status().loading_first && held == 0
    }

    pub fn is_error(&self) -> bool {
        self.status().last_error.is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    pub fn state(&self) -> FeedState {
        FeedState {
            items: self.items(),
            has_more: self.has_next_page(),
            is_loading: self.is_loading(),
            is_error: self.is_error(),
        }
    }
}
