//! Read-state mutations with optimistic cache patches.
//!
//! Both operations patch the cache before the backend call so the UI reacts
//! immediately, then invalidate the entry once the call settles, whether it
//! succeeded, failed or was dropped. A failure is not rolled back locally; the refetch
//! that follows restores the server's view.

use crate::backend::NotificationBackend;
use crate::cache::{FeedCache, FeedKey, QueryCache};
use crate::error::FeedError;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

/// Observable state of the read mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadMutationState {
    /// A single-item `set_read` is in flight
    pub is_pending: bool,
    /// A `mark_all_read` is in flight
    pub is_marking_all: bool,
    /// Error from the last `mark_all_read`, cleared when the next one starts
    pub mark_all_error: Option<String>,
}

#[derive(Debug, Default)]
struct MutationState {
    pending: usize,
    marking_all: usize,
    mark_all_error: Option<String>,
}

/// Coordinates read-state changes for one owner's feed.
#[derive(Clone)]
pub struct ReadMutations {
    cache: QueryCache,
    backend: Arc<dyn NotificationBackend>,
    key: Option<FeedKey>,
    state: Arc<Mutex<MutationState>>,
}

#[derive(Clone, Copy)]
enum Counter {
    Pending,
    MarkingAll,
}

impl MutationState {
    fn counter(&mut self, counter: Counter) -> &mut usize {
        match counter {
            Counter::Pending => &mut self.pending,
            Counter::MarkingAll => &mut self.marking_all,
        }
    }
}

/// Decrements an in-flight counter when dropped, so a cancelled call still
/// clears its flag.
struct InFlight<'a> {
    state: &'a Mutex<MutationState>,
    counter: Counter,
}

impl<'a> InFlight<'a> {
    fn start(state: &'a Mutex<MutationState>, counter: Counter) -> Self {
        *lock_state(state).counter(counter) += 1;
        Self { state, counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = lock_state(self.state);
        let n = state.counter(self.counter);
        *n = n.saturating_sub(1);
    }
}

/// Invalidates the entry when dropped, so a call that is cancelled before
/// the backend answers still schedules reconciliation.
struct Settle<'a> {
    cache: &'a QueryCache,
    key: &'a FeedKey,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        self.cache.invalidate(self.key);
    }
}

fn lock_state(state: &Mutex<MutationState>) -> MutexGuard<'_, MutationState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReadMutations {
    pub fn new(cache: QueryCache, backend: Arc<dyn NotificationBackend>, owner_id: Option<&str>) -> Self {
        Self {
            cache,
            backend,
            key: owner_id.map(FeedKey::notifications),
            state: Arc::new(Mutex::new(MutationState::default())),
        }
    }

    pub fn state(&self) -> ReadMutationState {
        let state = lock_state(&self.state);
        ReadMutationState {
            is_pending: state.pending > 0,
            is_marking_all: state.marking_all > 0,
            mark_all_error: state.mark_all_error.clone(),
        }
    }

    /// Mark one notification read (`is_read`) or unread.
    ///
    /// Returns the server's `read_at` for the item.
    pub async fn set_read(&self, id: &str, is_read: bool) -> Result<Option<DateTime<Utc>>, FeedError> {
        let key = self.key.clone().ok_or(FeedError::MissingOwner)?;

        let read_at = is_read.then(Utc::now);
        let patched = self
            .cache
            .update(&key, |feed| patch_read_at(feed, id, read_at))
            .unwrap_or(false);
        tracing::debug!(key = %key, id, is_read, patched, "Optimistic read-state patch");

        let result = {
            let _settle = Settle { cache: &self.cache, key: &key };
            let _in_flight = InFlight::start(&self.state, Counter::Pending);
            self.backend.set_read(key.owner_id(), id, is_read).await
        };

        result.map_err(|e| {
            tracing::warn!(key = %key, id, error = %e, "Setting read state failed");
            FeedError::Backend(e)
        })
    }

    /// Mark every unread notification of the owner as read.
    ///
    /// Returns the server-side `read_at` stamp.
    pub async fn mark_all_read(&self) -> Result<DateTime<Utc>, FeedError> {
        let Some(key) = self.key.clone() else {
            tracing::warn!("Mark all read requested without an owner");
            return Err(FeedError::MissingOwner);
        };

        let read_at = Utc::now();
        let patched = self
            .cache
            .update(&key, |feed| patch_all_unread(feed, read_at))
            .unwrap_or(0);
        tracing::debug!(key = %key, patched, "Optimistic mark-all-read patch");

        let result = {
            let _settle = Settle { cache: &self.cache, key: &key };
            let _in_flight = InFlight::start(&self.state, Counter::MarkingAll);
            lock_state(&self.state).mark_all_error = None;
            self.backend.set_all_read(key.owner_id()).await
        };

        result.map_err(|e| {
            let err = if e.is_permission_denied() {
                FeedError::PermissionDenied
            } else {
                FeedError::Backend(e)
            };
            tracing::warn!(key = %key, error = %err, "Mark all read failed");
            lock_state(&self.state).mark_all_error = Some(err.to_string());
            err
        })
    }
}

/// Swap the matching item for a copy with `read_at` set. Siblings keep their
/// `Arc`s. Returns whether an item was found.
fn patch_read_at(feed: &mut FeedCache, id: &str, read_at: Option<DateTime<Utc>>) -> bool {
    for page in feed.pages_mut().iter_mut() {
        if let Some(slot) = page.iter_mut().find(|item| item.id == id) {
            *slot = Arc::new(slot.with_read_at(read_at));
            return true;
        }
    }
    false
}

/// Stamp every unread item with the same `read_at`. Items already read keep
/// their original timestamp and `Arc`. Returns the number patched.
fn patch_all_unread(feed: &mut FeedCache, read_at: DateTime<Utc>) -> usize {
    let mut patched = 0;
    for slot in feed.pages_mut().iter_mut().flatten() {
        if slot.is_unread() {
            *slot = Arc::new(slot.with_read_at(Some(read_at)));
            patched += 1;
        }
    }
    patched
}
