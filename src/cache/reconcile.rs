use super::{FeedKey, QueryCache};
use crate::backend::{BackendError, NotificationBackend};
use crate::model::{FeedPage, PAGE_SIZE};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What became of a refetch once its pages arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
    /// The pages replaced the entry's window.
    Applied,
    /// The entry was written to while the refetch was in flight. Its pages
    /// were dropped so the newer local state survives.
    Superseded,
    /// The entry was discarded or replaced by a new generation.
    Discarded,
}

/// Reload every page `key` holds and replace the window with the result.
///
/// Loads `max(held, 1)` pages and stops early on a short page. The write-back
/// happens only if the entry has the same generation and revision it had
/// when the refetch started; an entry holding no pages is always overwritten.
pub async fn refetch_window(
    cache: &QueryCache,
    backend: &dyn NotificationBackend,
    key: &FeedKey,
) -> Result<RefetchOutcome, BackendError> {
    let Some(generation) = cache.generation(key) else {
        return Ok(RefetchOutcome::Discarded);
    };
    let (held, revision) = cache
        .read(key, |f| (f.page_count(), f.revision()))
        .unwrap_or((0, 0));

    let mut pages: Vec<FeedPage> = Vec::with_capacity(held.max(1));
    for cursor in 0..held.max(1) {
        let page = backend.fetch_page(key.owner_id(), cursor).await?;
        let full = page.len() == PAGE_SIZE;
        pages.push(page.into_iter().map(Arc::new).collect());
        if !full {
            break;
        }
    }

    let outcome = cache.update_if_current(key, generation, |feed| {
        if feed.revision() != revision && feed.page_count() > 0 {
            return RefetchOutcome::Superseded;
        }
        feed.replace_pages(pages);
        RefetchOutcome::Applied
    });
    Ok(outcome.unwrap_or(RefetchOutcome::Discarded))
}

/// Debounced refetch scheduler behind [`QueryCache::invalidate`].
///
/// Invalidations are collected for one debounce window after the first one
/// arrives; every distinct key seen in the window is then refetched once.
/// A refetch reloads as many pages as the entry held when it started and
/// replaces them wholesale, which repairs any drift left by local patches.
/// A refetch overtaken by a local write is queued again.
pub struct Reconciler {
    cache: QueryCache,
    backend: Arc<dyn NotificationBackend>,
    debounce: Duration,
}

/// Running reconciler. Dropping it stops refetching; invalidations after that
/// only mark entries stale.
pub struct ReconcilerHandle {
    cache: QueryCache,
    task: JoinHandle<()>,
    refetches: watch::Receiver<u64>,
}

impl Reconciler {
    pub fn new(cache: QueryCache, backend: Arc<dyn NotificationBackend>) -> Self {
        Self {
            cache,
            backend,
            debounce: Duration::ZERO,
        }
    }

    /// Window over which repeated invalidations collapse. Zero means "until
    /// the current task yields".
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn spawn(self) -> ReconcilerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (count_tx, count_rx) = watch::channel(0u64);
        let cache = self.cache.clone();
        cache.attach_reconciler(tx);

        let task = tokio::spawn(self.run(rx, count_tx));
        ReconcilerHandle {
            cache,
            task,
            refetches: count_rx,
        }
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<FeedKey>, count_tx: watch::Sender<u64>) {
        while let Some(first) = rx.recv().await {
            let mut pending = HashSet::from([first]);

            if self.debounce.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.debounce).await;
            }
            while let Ok(key) = rx.try_recv() {
                pending.insert(key);
            }

            for key in pending {
                match refetch_window(&self.cache, self.backend.as_ref(), &key).await {
                    Ok(RefetchOutcome::Applied) => tracing::debug!(key = %key, "Reconciled feed cache"),
                    Ok(RefetchOutcome::Superseded) => {
                        tracing::debug!(key = %key, "Feed cache changed during refetch, queued again");
                        self.cache.invalidate(&key);
                    }
                    Ok(RefetchOutcome::Discarded) => {
                        tracing::debug!(key = %key, "Feed cache discarded during refetch, result dropped")
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Refetch failed, keeping last good pages")
                    }
                }
                count_tx.send_modify(|n| *n += 1);
            }
        }
        tracing::debug!("Reconciler channel closed");
    }
}

impl ReconcilerHandle {
    /// Number of refetches attempted so far (successful or not).
    pub fn refetch_count(&self) -> u64 {
        *self.refetches.borrow()
    }

    /// Wait until at least `count` refetches have been attempted.
    pub async fn wait_for_refetches(&self, count: u64) {
        let mut rx = self.refetches.clone();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.cache.detach_reconciler();
        self.task.abort();
    }
}
