use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{FeedBackend, SupabaseBackend};
use crate::change_listener::ChangeListener;
use crate::config::FeedConfig;
use crate::error::FeedResult;
use crate::memory::MemoryPlatform;
use crate::mutator::OptimisticMutator;
use crate::query_cache::QueryCache;
use crate::realtime::{ChangeChannel, RealtimeChannel};
use crate::session::{AuthClient, Authenticator, SessionSource};

/// The four seams the sync core needs from a platform.
#[derive(Clone)]
pub struct FeedServices {
    pub backend: Arc<dyn FeedBackend>,
    pub channel: Arc<dyn ChangeChannel>,
    pub session: Arc<dyn SessionSource>,
    pub auth: Arc<dyn Authenticator>,
}

impl FeedServices {
    pub fn supabase(config: &FeedConfig) -> FeedResult<Self> {
        let auth = Arc::new(AuthClient::new(config.clone())?);
        let backend = SupabaseBackend::new(config.clone(), auth.clone())?;
        Ok(Self {
            backend: Arc::new(backend),
            channel: Arc::new(RealtimeChannel::new(config.clone())),
            session: auth.clone(),
            auth,
        })
    }

    pub fn memory(platform: &MemoryPlatform) -> Self {
        Self {
            backend: platform.backend(),
            channel: platform.channel(),
            session: platform.session(),
            auth: platform.authenticator(),
        }
    }
}

/// Ties the cache, the mutator and the change listener to the session.
/// Every sign-in gets a fresh listener and sign-out tears it down and empties
/// the cache. Each new feed generation also reloads the engagement panels
/// that were open.
pub struct FeedSync {
    services: FeedServices,
    cache: QueryCache,
    mutator: OptimisticMutator,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    follower: Option<JoinHandle<()>>,
}

impl FeedSync {
    pub fn start(services: FeedServices, reconnect_delay: Duration) -> Self {
        let cache = QueryCache::new(services.backend.clone());
        let mutator = OptimisticMutator::new(
            services.backend.clone(),
            services.session.clone(),
            cache.clone(),
        );
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            services.clone(),
            cache.clone(),
            mutator.clone(),
            reconnect_delay,
            cancel.clone(),
        ));
        let follower = tokio::spawn(follow_feed(cache.clone(), mutator.clone(), cancel.clone()));
        Self {
            services,
            cache,
            mutator,
            cancel,
            supervisor: Some(supervisor),
            follower: Some(follower),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn mutator(&self) -> &OptimisticMutator {
        &self.mutator
    }

    pub fn auth(&self) -> &Arc<dyn Authenticator> {
        &self.services.auth
    }

    pub fn session(&self) -> &Arc<dyn SessionSource> {
        &self.services.session
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                tracing::warn!(error = %err, "feed supervisor failed");
            }
        }
        if let Some(follower) = self.follower.take() {
            if let Err(err) = follower.await {
                tracing::warn!(error = %err, "engagement follower failed");
            }
        }
    }
}

impl Drop for FeedSync {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(
    services: FeedServices,
    cache: QueryCache,
    mutator: OptimisticMutator,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    let mut sessions = services.session.watch();
    let mut active: Option<(String, ChangeListener)> = None;
    loop {
        let user_id = sessions
            .borrow_and_update()
            .as_ref()
            .map(|session| session.user_id.clone());
        let active_user = active.as_ref().map(|(user, _)| user.clone());

        if user_id != active_user {
            if let Some((previous, listener)) = active.take() {
                listener.shutdown().await;
                cache.clear();
                tracing::info!(user_id = %previous, "feed sync stopped");
            }
            mutator.reset();
            if let Some(user_id) = user_id {
                let listener = ChangeListener::spawn(
                    services.channel.clone(),
                    cache.clone(),
                    services.session.clone(),
                    reconnect_delay,
                );
                tracing::info!(user_id = %user_id, "feed sync started");
                active = Some((user_id, listener));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    if let Some((_, listener)) = active {
        listener.shutdown().await;
    }
}

/// Reloads open engagement panels after every new feed generation. Changes
/// that arrive during a reload fold into one more pass.
async fn follow_feed(cache: QueryCache, mutator: OptimisticMutator, cancel: CancellationToken) {
    let mut feed = cache.subscribe();
    let mut seen = feed.borrow_and_update().generation;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = feed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let generation = feed.borrow_and_update().generation;
        if generation == seen {
            continue;
        }
        seen = generation;
        tracing::debug!(generation, "feed changed, reloading engagement");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = mutator.refresh_loaded() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn settle() {
        for _ in 0..40 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn signed_out_sync_stays_idle() {
        let platform = MemoryPlatform::new();
        let sync = FeedSync::start(FeedServices::memory(&platform), Duration::from_millis(50));
        settle().await;
        assert_eq!(platform.subscriptions(), 0);
        assert_eq!(platform.feed_fetches(), 0);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sign_in_loads_and_sign_out_clears() {
        let platform = MemoryPlatform::new();
        let author = platform.seed_demo();
        let sync = FeedSync::start(FeedServices::memory(&platform), Duration::from_millis(50));

        sync.auth().sign_in("kai@beatfeed.dev", "demo-pass").await.unwrap();
        settle().await;
        assert_eq!(sync.session().current_user_id(), Some(author));
        assert_eq!(sync.cache().current().posts.len(), 3);
        assert_eq!(platform.live_subscribers(), 1);

        sync.auth().sign_out().await.unwrap();
        settle().await;
        assert!(sync.cache().current().posts.is_empty());
        assert_eq!(platform.live_subscribers(), 0);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_feed_generation_reloads_open_panels() {
        let platform = MemoryPlatform::new();
        let kai = platform.seed_demo();
        let sync = FeedSync::start(FeedServices::memory(&platform), Duration::from_millis(50));
        sync.auth().sign_in("kai@beatfeed.dev", "demo-pass").await.unwrap();
        settle().await;

        let post = sync.cache().current().posts[0].clone();
        let before = sync.mutator().load_engagement(&post.id).await.unwrap();
        let generation = sync.cache().current().generation;

        let fan = platform.register("fan@example.com", "pw", "Fan");
        platform.seed_like(&fan, &post.id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        settle().await;

        assert!(sync.cache().current().generation > generation);
        let after = sync.mutator().engagement(&post.id);
        assert_eq!(after.like.count, before.like.count + 1);
        assert_eq!(sync.session().current_user_id(), Some(kai));
        sync.shutdown().await;
    }
}
