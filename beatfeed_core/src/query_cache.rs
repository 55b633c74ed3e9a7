use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::FeedBackend;
use crate::error::{FeedError, FeedResult};
use crate::models::Post;

/// What readers see. `posts` is swapped as a whole, so a reader holding a
/// snapshot never observes a half-applied refetch.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    pub posts: Arc<Vec<Post>>,
    pub fetching: bool,
    /// Message of the last failed refetch; cleared by the next success.
    pub error: Option<String>,
    /// Number of successful refetches applied so far.
    pub generation: u64,
    ticket: u64,
}

impl FeedSnapshot {
    /// Nothing has been fetched yet and a fetch is running.
    pub fn is_loading(&self) -> bool {
        self.fetching && self.generation == 0
    }

    pub fn is_stale(&self) -> bool {
        self.error.is_some()
    }
}

/// Last known feed result plus the refetch that replaces it.
#[derive(Clone)]
pub struct QueryCache {
    backend: Arc<dyn FeedBackend>,
    state: Arc<watch::Sender<FeedSnapshot>>,
    issued: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl QueryCache {
    pub fn new(backend: Arc<dyn FeedBackend>) -> Self {
        let (state, _) = watch::channel(FeedSnapshot::default());
        Self {
            backend,
            state: Arc::new(state),
            issued: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn current(&self) -> FeedSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.state.subscribe()
    }

    pub async fn refetch(&self) -> FeedResult<FeedSnapshot> {
        self.refetch_until(&CancellationToken::new()).await
    }

    /// Runs the feed query and applies its result unless `cancel` fires first.
    /// Results of refetches overtaken by a later one are dropped.
    pub async fn refetch_until(&self, cancel: &CancellationToken) -> FeedResult<FeedSnapshot> {
        if cancel.is_cancelled() {
            return Err(FeedError::Cancelled);
        }
        let ticket = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|snapshot| {
            let changed = !snapshot.fetching;
            snapshot.fetching = true;
            changed
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.backend.fetch_feed() => Some(result),
        };
        let still_fetching = self.in_flight.fetch_sub(1, Ordering::SeqCst) > 1;

        match outcome {
            None => {
                self.state.send_if_modified(|snapshot| {
                    let changed = snapshot.fetching != still_fetching;
                    snapshot.fetching = still_fetching;
                    changed
                });
                tracing::debug!(ticket, "refetch discarded after cancellation");
                Err(FeedError::Cancelled)
            }
            Some(Ok(mut posts)) => {
                sort_feed(&mut posts);
                let count = posts.len();
                let mut applied = false;
                self.state.send_modify(|snapshot| {
                    snapshot.fetching = still_fetching;
                    if ticket > snapshot.ticket {
                        snapshot.posts = Arc::new(posts);
                        snapshot.error = None;
                        snapshot.generation += 1;
                        snapshot.ticket = ticket;
                        applied = true;
                    }
                });
                if applied {
                    tracing::debug!(ticket, count, "feed cache replaced");
                } else {
                    tracing::debug!(ticket, "refetch overtaken by a newer result");
                }
                Ok(self.current())
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "feed refetch failed, keeping cached posts");
                let message = err.to_string();
                self.state.send_modify(|snapshot| {
                    snapshot.fetching = still_fetching;
                    if ticket > snapshot.ticket {
                        snapshot.error = Some(message);
                    }
                });
                Err(err)
            }
        }
    }

    /// Drops cached posts, e.g. after sign-out.
    pub fn clear(&self) {
        let ticket = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|snapshot| {
            snapshot.posts = Arc::new(Vec::new());
            snapshot.error = None;
            snapshot.ticket = ticket;
        });
    }
}

/// Newest first, missing timestamps before everything else, ties by id so
/// that unchanged data always comes back in the same order.
pub fn sort_feed(posts: &mut [Post]) {
    posts.sort_by(feed_order);
}

fn feed_order(a: &Post, b: &Post) -> CmpOrdering {
    let by_time = match (&a.created_at, &b.created_at) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(x), Some(y)) => y.cmp(x),
    };
    by_time.then_with(|| a.id.cmp(&b.id))
}
