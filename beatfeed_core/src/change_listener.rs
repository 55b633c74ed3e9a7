use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::query_cache::QueryCache;
use crate::realtime::{ChangeChannel, FeedTable, Subscription};
use crate::session::SessionSource;

/// Keeps one change subscription alive and refetches the feed whenever a
/// watched table changes. Bursts of notifications collapse into at most one
/// extra refetch behind the one already running.
pub struct ChangeListener {
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ChangeListener {
    pub fn spawn(
        channel: Arc<dyn ChangeChannel>,
        cache: QueryCache,
        session: Arc<dyn SessionSource>,
        reconnect_delay: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            run_listener(channel, cache, session, reconnect_delay, worker_cancel).await;
        });
        Self {
            cancel,
            worker: Some(worker),
        }
    }

    /// Stops listening. Once this returns no refetch started by the listener
    /// will be applied.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "change listener task failed");
            }
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_listener(
    channel: Arc<dyn ChangeChannel>,
    cache: QueryCache,
    session: Arc<dyn SessionSource>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    let mut attempt: u64 = 0;
    loop {
        let token = match session.access_token().await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(error = %err, "no usable access token for realtime");
                None
            }
        };
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = channel.subscribe(&FeedTable::ALL, token) => result,
        };
        attempt += 1;

        match subscribed {
            Ok(mut subscription) => {
                tracing::info!(attempt, "listening for feed changes");
                // Covers whatever changed before the subscription was live.
                refresh(&cache, &cancel).await;
                pump(&mut subscription, &cache, &cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                tracing::warn!("change channel disconnected");
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "change subscription failed");
                refresh(&cache, &cancel).await;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    tracing::debug!("change listener stopped");
}

/// Forwards notifications into refetches until the subscription ends or the
/// listener is cancelled.
async fn pump(subscription: &mut Subscription, cache: &QueryCache, cancel: &CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = subscription.next() => event,
        };
        let Some(event) = event else {
            return;
        };
        let skipped = subscription.drain();
        tracing::debug!(table = %event.table, kind = ?event.kind, skipped, "feed change");

        loop {
            let mut again = false;
            let mut disconnected = false;
            {
                let fetch = cache.refetch_until(cancel);
                tokio::pin!(fetch);
                loop {
                    tokio::select! {
                        biased;
                        result = &mut fetch => {
                            if let Err(err) = result {
                                tracing::debug!(error = %err, "refetch after change did not apply");
                            }
                            break;
                        }
                        event = subscription.next(), if !disconnected => match event {
                            Some(_) => again = true,
                            None => disconnected = true,
                        },
                    }
                }
            }
            if cancel.is_cancelled() || disconnected {
                return;
            }
            if !again {
                break;
            }
            subscription.drain();
        }
    }
}

async fn refresh(cache: &QueryCache, cancel: &CancellationToken) {
    if let Err(err) = cache.refetch_until(cancel).await {
        tracing::debug!(error = %err, "feed refresh did not apply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPlatform;
    use crate::realtime::ChangeKind;
    use pretty_assertions::assert_eq;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_to_all_tables_and_loads_once() {
        let platform = MemoryPlatform::new();
        let cache = QueryCache::new(platform.backend());
        let listener = ChangeListener::spawn(
            platform.channel(),
            cache.clone(),
            platform.session(),
            Duration::from_millis(100),
        );
        settle().await;

        assert_eq!(platform.subscriptions(), 1);
        assert_eq!(platform.feed_fetches(), 1);
        listener.shutdown().await;
        assert_eq!(platform.live_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_table_triggers_a_refetch() {
        let platform = MemoryPlatform::new();
        let cache = QueryCache::new(platform.backend());
        let listener = ChangeListener::spawn(
            platform.channel(),
            cache.clone(),
            platform.session(),
            Duration::from_millis(100),
        );
        settle().await;

        for table in FeedTable::ALL {
            platform.notify(table, ChangeKind::Update);
            settle().await;
        }
        assert_eq!(platform.feed_fetches(), 4);
        listener.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscribe_is_retried() {
        let platform = MemoryPlatform::new();
        platform.fail_subscribe(true);
        let cache = QueryCache::new(platform.backend());
        let listener = ChangeListener::spawn(
            platform.channel(),
            cache.clone(),
            platform.session(),
            Duration::from_millis(100),
        );
        settle().await;
        assert_eq!(platform.subscriptions(), 1);

        platform.fail_subscribe(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(platform.subscriptions(), 2);
        assert_eq!(platform.live_subscribers(), 1);
        listener.shutdown().await;
    }
}
