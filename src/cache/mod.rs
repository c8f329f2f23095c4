//! Keyed cache of windowed feeds.
//!
//! - [`FeedCache`] - the pages held for one feed plus the cursors that produced them
//! - [`QueryCache`] - a bounded arena of `FeedCache` entries addressed by [`FeedKey`]
//! - [`Reconciler`] - background task that collapses invalidations into refetches
//!
//! Every mutation of an entry runs under the arena lock and never spans an
//! `.await`, so each patch is atomic with respect to the other input channels.

mod reconcile;

pub use reconcile::{refetch_window, RefetchOutcome, Reconciler, ReconcilerHandle};

use crate::model::{FeedPage, NotificationItem, PAGE_SIZE};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Scope of the notification feed inside the cache arena.
pub const NOTIFICATIONS_SCOPE: &str = "notifications";

// ============================================================================
// Cache Key
// ============================================================================

/// Immutable composite key: (owner id, feed variant).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    owner_id: Arc<str>,
    scope: &'static str,
}

impl FeedKey {
    pub fn new(owner_id: &str, scope: &'static str) -> Self {
        Self {
            owner_id: Arc::from(owner_id),
            scope,
        }
    }

    pub fn notifications(owner_id: &str) -> Self {
        Self::new(owner_id, NOTIFICATIONS_SCOPE)
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn scope(&self) -> &'static str {
        self.scope
    }
}

impl std::fmt::Display for FeedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.owner_id)
    }
}

// ============================================================================
// Feed Cache
// ============================================================================

/// Pages held for one feed.
///
/// `cursors[i]` is the cursor that produced `pages[i]`. The feed continues
/// past the last page only while that page is full.
///
/// `revision` advances on every local write: a stored page, a replaced
/// window, or a patch through `pages_mut`. A refetch that started at an older
/// revision is superseded and must not overwrite the entry.
#[derive(Debug, Clone, Default)]
pub struct FeedCache {
    pages: Vec<FeedPage>,
    cursors: Vec<usize>,
    stale: bool,
    revision: u64,
}

impl FeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from already-fetched pages, cursors `0..n`.
    pub fn from_pages(pages: Vec<FeedPage>) -> Self {
        let cursors = (0..pages.len()).collect();
        Self {
            pages,
            cursors,
            stale: false,
            revision: 0,
        }
    }

    pub fn pages(&self) -> &[FeedPage] {
        &self.pages
    }

    pub fn cursors(&self) -> &[usize] {
        &self.cursors
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn has_next_page(&self) -> bool {
        self.pages.last().is_some_and(|page| page.len() == PAGE_SIZE)
    }

    /// Cursor the next fetch should request, or `None` once the feed is terminal.
    pub fn next_cursor(&self) -> Option<usize> {
        if self.pages.is_empty() || self.has_next_page() {
            Some(self.pages.len())
        } else {
            None
        }
    }

    /// Lazy concatenation of held pages in page order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<NotificationItem>> + Clone + '_ {
        self.pages.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(Vec::is_empty)
    }

    /// Store the page fetched for `cursor`.
    ///
    /// A cursor equal to the page count appends; a smaller one replaces that
    /// page in place. A cursor past the end would leave a gap and is refused.
    pub fn store_page(&mut self, cursor: usize, page: Vec<NotificationItem>) -> bool {
        let page: FeedPage = page.into_iter().map(Arc::new).collect();
        match cursor.cmp(&self.pages.len()) {
            std::cmp::Ordering::Equal => {
                self.pages.push(page);
                self.cursors.push(cursor);
            }
            std::cmp::Ordering::Less => {
                self.pages[cursor] = page;
            }
            std::cmp::Ordering::Greater => return false,
        }
        self.revision += 1;
        true
    }

    /// Replace every held page with an authoritative refetch and clear `stale`.
    pub fn replace_pages(&mut self, pages: Vec<FeedPage>) {
        let revision = self.revision + 1;
        *self = Self::from_pages(pages);
        self.revision = revision;
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub(crate) fn pages_mut(&mut self) -> &mut Vec<FeedPage> {
        self.revision += 1;
        &mut self.pages
    }
}

// ============================================================================
// Query Cache
// ============================================================================

struct Entry {
    feed: FeedCache,
    generation: u64,
}

struct CacheInner {
    entries: LruCache<FeedKey, Entry>,
    next_generation: u64,
    invalidations: Option<mpsc::UnboundedSender<FeedKey>>,
}

/// Bounded arena of feed caches shared by the store, the bridge and the
/// mutation coordinator.
///
/// Each entry carries a generation number assigned when it is created. Work
/// that started against an entry (a fetch, a refetch) writes back only if the
/// entry still has the same generation, so results for a discarded owner are
/// dropped instead of resurrecting it.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl QueryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                next_generation: 1,
                invalidations: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of an entry. Cheap: items are shared `Arc`s.
    pub fn get(&self, key: &FeedKey) -> Option<FeedCache> {
        self.lock().entries.get(key).map(|e| e.feed.clone())
    }

    /// Replace (or create) an entry. Always starts a new generation.
    pub fn set(&self, key: FeedKey, feed: FeedCache) -> u64 {
        let mut inner = self.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        if let Some((evicted, _)) = inner.entries.push(key.clone(), Entry { feed, generation }) {
            if evicted != key {
                tracing::debug!(key = %evicted, "Evicted least recently used feed cache");
            }
        }
        generation
    }

    /// Generation of an existing entry, creating an empty one if absent.
    pub fn ensure(&self, key: &FeedKey) -> u64 {
        if let Some(generation) = self.generation(key) {
            return generation;
        }
        tracing::debug!(key = %key, "Creating feed cache entry");
        self.set(key.clone(), FeedCache::new())
    }

    pub fn generation(&self, key: &FeedKey) -> Option<u64> {
        self.lock().entries.peek(key).map(|e| e.generation)
    }

    pub fn contains(&self, key: &FeedKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Read an entry in place without cloning it.
    pub fn read<R>(&self, key: &FeedKey, f: impl FnOnce(&FeedCache) -> R) -> Option<R> {
        self.lock().entries.peek(key).map(|e| f(&e.feed))
    }

    /// Patch an existing entry atomically. Returns `None` if there is no entry.
    pub fn update<R>(&self, key: &FeedKey, f: impl FnOnce(&mut FeedCache) -> R) -> Option<R> {
        self.lock().entries.get_mut(key).map(|e| f(&mut e.feed))
    }

    /// Patch an entry only if it still has `generation`.
    pub fn update_if_current<R>(
        &self,
        key: &FeedKey,
        generation: u64,
        f: impl FnOnce(&mut FeedCache) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.generation == generation => Some(f(&mut entry.feed)),
            _ => None,
        }
    }

    /// Discard an entry. In-flight work for it will be dropped on completion.
    pub fn remove(&self, key: &FeedKey) -> Option<FeedCache> {
        let removed = self.lock().entries.pop(key).map(|e| e.feed);
        if removed.is_some() {
            tracing::debug!(key = %key, "Discarded feed cache entry");
        }
        removed
    }

    /// Mark an entry stale and schedule a coalesced background refetch.
    ///
    /// No-op for keys without an entry.
    pub fn invalidate(&self, key: &FeedKey) {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.peek_mut(key) else {
            tracing::debug!(key = %key, "Invalidate for absent entry ignored");
            return;
        };
        entry.feed.mark_stale();

        let reconciler_gone = inner
            .invalidations
            .as_ref()
            .is_some_and(|tx| tx.send(key.clone()).is_err());
        if reconciler_gone {
            tracing::warn!(key = %key, "Reconciler stopped, invalidation will not refetch");
            inner.invalidations = None;
        }
    }

    pub(crate) fn attach_reconciler(&self, tx: mpsc::UnboundedSender<FeedKey>) {
        self.lock().invalidations = Some(tx);
    }

    pub(crate) fn detach_reconciler(&self) {
        self.lock().invalidations = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use crate::model::{NotificationKind, Payload};

    fn item(n: usize) -> NotificationItem {
        NotificationItem {
            id: format!("n{n}"),
            kind: NotificationKind::from("system"),
            payload: Payload::default(),
            read_at: None,
            created_at: DateTime::<Utc>::from_timestamp(1_700_000_000 - n as i64, 0).unwrap(),
        }
    }

    fn page(range: std::ops::Range<usize>) -> Vec<NotificationItem> {
        range.map(item).collect()
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_empty_cache_requests_cursor_zero() {
        let feed = FeedCache::new();
        assert!(!feed.has_next_page());
        assert_eq!(feed.next_cursor(), Some(0));
    }

    #[test]
    fn test_full_last_page_continues() {
        let mut feed = FeedCache::new();
        assert!(feed.store_page(0, page(0..PAGE_SIZE)));
        assert!(feed.has_next_page());
        assert_eq!(feed.next_cursor(), Some(1));

        assert!(feed.store_page(1, page(PAGE_SIZE..PAGE_SIZE + 5)));
        assert!(!feed.has_next_page());
        assert_eq!(feed.next_cursor(), None);
        assert_eq!(feed.cursors(), &[0, 1]);
    }

    #[test]
    fn test_store_page_refuses_gap() {
        let mut feed = FeedCache::new();
        assert!(!feed.store_page(2, page(0..3)));
        assert_eq!(feed.page_count(), 0);
    }

    #[test]
    fn test_store_page_replaces_existing_cursor() {
        let mut feed = FeedCache::new();
        feed.store_page(0, page(0..3));
        feed.store_page(0, page(10..12));
        assert_eq!(feed.page_count(), 1);
        let ids: Vec<_> = feed.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["n10", "n11"]);
    }

    #[test]
    fn test_revision_advances_on_every_write() {
        let mut feed = FeedCache::new();
        assert!(feed.store_page(0, page(0..PAGE_SIZE)));
        let stored = feed.revision();

        feed.pages_mut()[0].remove(0);
        let patched = feed.revision();
        assert!(patched > stored);

        feed.replace_pages(vec![]);
        let replaced = feed.revision();
        assert!(replaced > patched);

        assert!(!feed.store_page(3, page(0..1)));
        feed.mark_stale();
        assert_eq!(feed.revision(), replaced);
    }

    #[test]
    fn test_iter_is_repeatable() {
        let mut feed = FeedCache::new();
        feed.store_page(0, page(0..PAGE_SIZE));
        feed.store_page(1, page(PAGE_SIZE..PAGE_SIZE + 2));

        let first: Vec<_> = feed.iter().cloned().collect();
        let second: Vec<_> = feed.iter().cloned().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), feed.len());
    }

    #[test]
    fn test_update_if_current_rejects_replaced_entry() {
        let cache = QueryCache::new(capacity(4));
        let key = FeedKey::notifications("alice");
        let old = cache.ensure(&key);

        cache.remove(&key);
        let new = cache.ensure(&key);
        assert_ne!(old, new);

        assert!(cache
            .update_if_current(&key, old, |f| f.store_page(0, page(0..1)))
            .is_none());
        assert!(cache
            .update_if_current(&key, new, |f| f.store_page(0, page(0..1)))
            .is_some());
    }

    #[test]
    fn test_ensure_keeps_existing_generation() {
        let cache = QueryCache::new(capacity(4));
        let key = FeedKey::notifications("alice");
        let generation = cache.ensure(&key);
        assert_eq!(cache.ensure(&key), generation);
    }

    #[test]
    fn test_invalidate_marks_stale_and_queues_key() {
        let cache = QueryCache::new(capacity(4));
        let (tx, mut rx) = mpsc::unbounded_channel();
        cache.attach_reconciler(tx);

        let key = FeedKey::notifications("alice");
        cache.invalidate(&key);
        assert!(rx.try_recv().is_err(), "absent entry must not queue");

        cache.ensure(&key);
        cache.invalidate(&key);
        assert!(cache.read(&key, FeedCache::is_stale).unwrap());
        assert_eq!(rx.try_recv().unwrap(), key);
    }

    #[test]
    fn test_capacity_evicts_least_recent_owner() {
        let cache = QueryCache::new(capacity(2));
        let a = FeedKey::notifications("a");
        let b = FeedKey::notifications("b");
        let c = FeedKey::notifications("c");
        cache.ensure(&a);
        cache.ensure(&b);
        cache.get(&a);
        cache.ensure(&c);

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn test_keys_differ_by_scope() {
        assert_ne!(
            FeedKey::notifications("a"),
            FeedKey::new("a", "mentions")
        );
        assert_eq!(FeedKey::notifications("a").to_string(), "notifications:a");
    }
}
