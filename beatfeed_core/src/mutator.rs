use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

use crate::backend::FeedBackend;
use crate::error::{FeedError, FeedResult};
use crate::models::{AudioUpload, Comment, NewComment, NewPost, NewReaction, Post, ReactionKind};
use crate::query_cache::QueryCache;
use crate::session::{require_user, SessionSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeState {
    Unliked,
    Liked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeView {
    pub state: LikeState,
    pub count: u32,
    /// Remote writes for this post are still in flight.
    pub pending: bool,
    /// Set when the last lane ended in a revert.
    pub error: Option<String>,
}

impl LikeView {
    pub fn liked(&self) -> bool {
        self.state == LikeState::Liked
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engagement {
    pub like: LikeView,
    pub comments: Vec<Comment>,
    pub loaded: bool,
}

/// Explicit user answer to "are you sure?" before a destructive action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Declined,
}

#[derive(Default)]
struct LikeEntry {
    liked: bool,
    /// Last state the server acknowledged.
    confirmed: bool,
    /// Likes by everyone except the current user.
    others: u32,
    pending: usize,
    /// Writes settled so far; a load that saw a different value is stale.
    settled: u64,
    failure: Option<FeedError>,
    error: Option<String>,
    lane: Option<mpsc::UnboundedSender<LikeWrite>>,
}

impl LikeEntry {
    fn view(&self) -> LikeView {
        LikeView {
            state: if self.liked {
                LikeState::Liked
            } else {
                LikeState::Unliked
            },
            count: self.others + u32::from(self.liked),
            pending: self.pending > 0,
            error: self.error.clone(),
        }
    }
}

#[derive(Default)]
struct Panel {
    like: LikeEntry,
    comments: Vec<Comment>,
    loaded: bool,
}

impl Panel {
    fn view(&self) -> Engagement {
        Engagement {
            like: self.like.view(),
            comments: self.comments.clone(),
            loaded: self.loaded,
        }
    }
}

#[derive(Default)]
struct MutatorState {
    user_id: Option<String>,
    /// Bumped whenever local state is thrown away, so stale lanes and loads
    /// do not write into the new state.
    epoch: u64,
    panels: HashMap<String, Panel>,
}

impl MutatorState {
    fn reset_for(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
        self.epoch += 1;
        self.panels.clear();
    }

    fn align_user(&mut self, user_id: &str) {
        if self.user_id.as_deref() != Some(user_id) {
            self.reset_for(Some(user_id.to_string()));
        }
    }
}

struct LikeWrite {
    target: bool,
    done: oneshot::Sender<FeedResult<LikeView>>,
}

/// Result of [`OptimisticMutator::toggle_like`]: the state shown right away
/// plus a handle on the lane's eventual outcome.
pub struct PendingToggle {
    pub optimistic: LikeView,
    outcome: oneshot::Receiver<FeedResult<LikeView>>,
}

impl PendingToggle {
    /// Waits until every write queued for the post has settled. Returns the
    /// settled view, or the write error after local state was reverted.
    pub async fn settled(self) -> FeedResult<LikeView> {
        self.outcome.await.unwrap_or(Err(FeedError::Cancelled))
    }
}

/// Optimistic engagement writes: likes, comments, posts and deletes.
///
/// A like toggle is applied locally at once. The remote writes for one post
/// go through a single ordered lane, so the server ends in the state of the
/// last toggle. When a lane drains in a state the server never confirmed,
/// the like snaps back to the last confirmed state.
#[derive(Clone)]
pub struct OptimisticMutator {
    backend: Arc<dyn FeedBackend>,
    session: Arc<dyn SessionSource>,
    cache: QueryCache,
    state: Arc<Mutex<MutatorState>>,
}

impl OptimisticMutator {
    pub fn new(
        backend: Arc<dyn FeedBackend>,
        session: Arc<dyn SessionSource>,
        cache: QueryCache,
    ) -> Self {
        Self {
            backend,
            session,
            cache,
            state: Arc::new(Mutex::new(MutatorState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MutatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forgets all engagement state, e.g. when the signed-in user changes.
    pub fn reset(&self) {
        let user_id = self.session.current_user_id();
        self.lock().reset_for(user_id);
    }

    pub fn engagement(&self, post_id: &str) -> Engagement {
        self.lock()
            .panels
            .get(post_id)
            .map(Panel::view)
            .unwrap_or_else(|| Panel::default().view())
    }

    pub fn owns(&self, author_id: &str) -> bool {
        self.session.current_user_id().as_deref() == Some(author_id)
    }

    pub fn can_delete_post(&self, post: &Post) -> bool {
        self.owns(&post.user_id)
    }

    pub fn can_delete_comment(&self, comment: &Comment) -> bool {
        self.owns(&comment.user_id)
    }

    /// Flips the like on `post_id` locally and queues the matching remote
    /// write behind any writes still in flight for the same post.
    pub fn toggle_like(&self, post_id: &str) -> FeedResult<PendingToggle> {
        let user_id = require_user(self.session.as_ref())?;
        let (done, outcome) = oneshot::channel();

        let mut state = self.lock();
        state.align_user(&user_id);
        let epoch = state.epoch;
        let entry = &mut state.panels.entry(post_id.to_string()).or_default().like;

        entry.liked = !entry.liked;
        entry.pending += 1;
        entry.error = None;
        let write = LikeWrite {
            target: entry.liked,
            done,
        };
        let write = match entry.lane.as_ref() {
            Some(lane) => match lane.send(write) {
                Ok(()) => None,
                Err(mpsc::error::SendError(write)) => Some(write),
            },
            None => Some(write),
        };
        if let Some(write) = write {
            let (lane, rx) = mpsc::unbounded_channel();
            // Cannot fail: the receiver is alive right here.
            let _ = lane.send(write);
            entry.lane = Some(lane);
            let worker = LaneWorker {
                backend: self.backend.clone(),
                state: self.state.clone(),
                epoch,
                post_id: post_id.to_string(),
                user_id: user_id.clone(),
            };
            tokio::spawn(worker.run(rx));
        }
        let optimistic = entry.view();
        drop(state);

        tracing::debug!(post_id, liked = optimistic.liked(), "like toggled");
        Ok(PendingToggle {
            optimistic,
            outcome,
        })
    }

    /// Loads like count, the current user's like and the comment list.
    /// Like state is left alone while writes for the post are pending, or
    /// when one settled while the read was in flight.
    pub async fn load_engagement(&self, post_id: &str) -> FeedResult<Engagement> {
        self.load(post_id, None).await
    }

    /// Reloads every panel that was loaded before, e.g. after the feed
    /// changed. Stops early if the user changes underneath it.
    pub async fn refresh_loaded(&self) {
        let (epoch, post_ids) = {
            let state = self.lock();
            let post_ids: Vec<String> = state
                .panels
                .iter()
                .filter(|(_, panel)| panel.loaded)
                .map(|(post_id, _)| post_id.clone())
                .collect();
            (state.epoch, post_ids)
        };
        for post_id in post_ids {
            match self.load(&post_id, Some(epoch)).await {
                Ok(_) => {}
                Err(FeedError::Cancelled) | Err(FeedError::Auth(_)) => return,
                Err(err) => {
                    tracing::warn!(post_id = %post_id, error = %err, "failed to reload engagement");
                }
            }
        }
    }

    async fn load(&self, post_id: &str, expected_epoch: Option<u64>) -> FeedResult<Engagement> {
        let user_id = require_user(self.session.as_ref())?;
        let (epoch, settled) = {
            let mut state = self.lock();
            state.align_user(&user_id);
            if expected_epoch.is_some_and(|expected| expected != state.epoch) {
                return Err(FeedError::Cancelled);
            }
            let settled = state
                .panels
                .get(post_id)
                .map_or(0, |panel| panel.like.settled);
            (state.epoch, settled)
        };
        let (summary, comments) = tokio::try_join!(
            self.backend.like_summary(post_id, &user_id),
            self.backend.list_comments(post_id),
        )?;

        let mut state = self.lock();
        if state.epoch != epoch {
            return Err(FeedError::Cancelled);
        }
        let panel = state.panels.entry(post_id.to_string()).or_default();
        panel.comments = comments;
        panel.loaded = true;
        let like = &mut panel.like;
        if like.pending == 0 && like.settled == settled {
            like.liked = summary.liked_by_me;
            like.confirmed = summary.liked_by_me;
            like.others = summary.count.saturating_sub(u32::from(summary.liked_by_me));
            like.error = None;
        } else {
            tracing::debug!(post_id, "like summary overtaken by local writes");
        }
        Ok(panel.view())
    }

    pub async fn add_comment(&self, post_id: &str, text: &str) -> FeedResult<Engagement> {
        let content = text.trim();
        if content.is_empty() {
            return Err(FeedError::validation("comment cannot be empty"));
        }
        let user_id = require_user(self.session.as_ref())?;
        self.backend
            .insert_comment(&NewComment {
                post_id: post_id.to_string(),
                user_id,
                content: content.to_string(),
            })
            .await?;
        tracing::info!(post_id, "comment added");
        self.load_engagement(post_id).await
    }

    pub async fn delete_comment(
        &self,
        post_id: &str,
        comment_id: &str,
        confirmation: Confirmation,
    ) -> FeedResult<DeleteOutcome> {
        if confirmation == Confirmation::Declined {
            return Ok(DeleteOutcome::Declined);
        }
        let user_id = require_user(self.session.as_ref())?;
        let author = self.lock().panels.get(post_id).and_then(|panel| {
            panel
                .comments
                .iter()
                .find(|comment| comment.id == comment_id)
                .map(|comment| comment.user_id.clone())
        });
        if author.is_some_and(|author| author != user_id) {
            return Err(FeedError::Forbidden(
                "only the author can delete this comment".into(),
            ));
        }

        self.backend.delete_comment(comment_id).await?;
        tracing::info!(post_id, comment_id, "comment deleted");
        {
            let mut state = self.lock();
            if let Some(panel) = state.panels.get_mut(post_id) {
                panel.comments.retain(|comment| comment.id != comment_id);
            }
        }
        if let Err(err) = self.load_engagement(post_id).await {
            tracing::warn!(post_id, error = %err, "failed to refresh comments after delete");
        }
        Ok(DeleteOutcome::Deleted)
    }

    pub async fn delete_post(
        &self,
        post_id: &str,
        confirmation: Confirmation,
    ) -> FeedResult<DeleteOutcome> {
        if confirmation == Confirmation::Declined {
            return Ok(DeleteOutcome::Declined);
        }
        let user_id = require_user(self.session.as_ref())?;
        let author = self
            .cache
            .current()
            .posts
            .iter()
            .find(|post| post.id == post_id)
            .map(|post| post.user_id.clone());
        if author.is_some_and(|author| author != user_id) {
            return Err(FeedError::Forbidden(
                "only the author can delete this post".into(),
            ));
        }

        self.backend.delete_post(post_id).await?;
        tracing::info!(post_id, "post deleted");
        self.lock().panels.remove(post_id);
        if let Err(err) = self.cache.refetch().await {
            tracing::warn!(post_id, error = %err, "failed to refresh feed after delete");
        }
        Ok(DeleteOutcome::Deleted)
    }

    /// Publishes a post, uploading the audio file first when one is given.
    pub async fn create_post(&self, content: &str, audio: Option<AudioUpload>) -> FeedResult<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(FeedError::validation("post content cannot be empty"));
        }
        let user_id = require_user(self.session.as_ref())?;
        let audio_url = match audio {
            Some(upload) => Some(self.backend.upload_audio(&user_id, &upload).await?),
            None => None,
        };
        self.backend
            .insert_post(&NewPost {
                content: content.to_string(),
                audio_url,
                user_id,
            })
            .await?;
        tracing::info!("post created");
        if let Err(err) = self.cache.refetch().await {
            tracing::warn!(error = %err, "failed to refresh feed after posting");
        }
        Ok(())
    }
}

/// Drains one post's write lane in order.
struct LaneWorker {
    backend: Arc<dyn FeedBackend>,
    state: Arc<Mutex<MutatorState>>,
    epoch: u64,
    post_id: String,
    user_id: String,
}

impl LaneWorker {
    fn with_entry<T>(&self, f: impl FnOnce(&mut LikeEntry) -> T) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.epoch != self.epoch {
            return None;
        }
        state.panels.get_mut(&self.post_id).map(|panel| f(&mut panel.like))
    }

    async fn run(self, mut writes: mpsc::UnboundedReceiver<LikeWrite>) {
        let mut waiters = Vec::new();
        while let Some(write) = writes.recv().await {
            waiters.push(write.done);
            let skip = self
                .with_entry(|entry| entry.failure.is_some() && entry.confirmed == write.target)
                .unwrap_or(true);
            let result = if skip {
                Ok(())
            } else {
                self.send(write.target).await
            };

            let settled = self.with_entry(|entry| {
                entry.pending = entry.pending.saturating_sub(1);
                entry.settled += 1;
                match result {
                    Ok(()) => {
                        if !skip {
                            entry.confirmed = write.target;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(post_id = %self.post_id, error = %err, "like write failed");
                        entry.failure.get_or_insert(err);
                    }
                }
                if entry.pending > 0 {
                    return None;
                }
                entry.lane = None;
                Some(match entry.failure.take() {
                    Some(err) if entry.liked != entry.confirmed => {
                        entry.liked = entry.confirmed;
                        entry.error = Some(err.to_string());
                        Err(err)
                    }
                    Some(err) => {
                        // A later write got the server to the wanted state.
                        tracing::debug!(post_id = %self.post_id, error = %err, "like lane recovered");
                        entry.error = None;
                        Ok(entry.view())
                    }
                    None => Ok(entry.view()),
                })
            });

            match settled {
                Some(Some(outcome)) => {
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(outcome.clone());
                    }
                    return;
                }
                Some(None) => {}
                None => break,
            }
        }
        tracing::debug!(post_id = %self.post_id, "like lane abandoned");
        for waiter in waiters {
            let _ = waiter.send(Err(FeedError::Cancelled));
        }
    }

    async fn send(&self, liked: bool) -> FeedResult<()> {
        if liked {
            let reaction = NewReaction {
                post_id: self.post_id.clone(),
                user_id: self.user_id.clone(),
                kind: ReactionKind::Like,
            };
            match self.backend.insert_reaction(&reaction).await {
                // The row is already there, which is the state we wanted.
                Err(FeedError::Conflict(_)) => Ok(()),
                other => other,
            }
        } else {
            self.backend
                .delete_reaction(&self.post_id, &self.user_id, ReactionKind::Like)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPlatform;
    use crate::models::LikeSummary;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// Reads the like summary, then sits on it before answering.
    struct SlowSummary {
        inner: Arc<dyn FeedBackend>,
        hold: Duration,
    }

    #[async_trait]
    impl FeedBackend for SlowSummary {
        async fn fetch_feed(&self) -> FeedResult<Vec<Post>> {
            self.inner.fetch_feed().await
        }

        async fn like_summary(&self, post_id: &str, user_id: &str) -> FeedResult<LikeSummary> {
            let summary = self.inner.like_summary(post_id, user_id).await;
            tokio::time::sleep(self.hold).await;
            summary
        }

        async fn list_comments(&self, post_id: &str) -> FeedResult<Vec<Comment>> {
            self.inner.list_comments(post_id).await
        }

        async fn insert_post(&self, post: &NewPost) -> FeedResult<()> {
            self.inner.insert_post(post).await
        }

        async fn delete_post(&self, post_id: &str) -> FeedResult<()> {
            self.inner.delete_post(post_id).await
        }

        async fn insert_reaction(&self, reaction: &NewReaction) -> FeedResult<()> {
            self.inner.insert_reaction(reaction).await
        }

        async fn delete_reaction(
            &self,
            post_id: &str,
            user_id: &str,
            kind: ReactionKind,
        ) -> FeedResult<()> {
            self.inner.delete_reaction(post_id, user_id, kind).await
        }

        async fn insert_comment(&self, comment: &NewComment) -> FeedResult<()> {
            self.inner.insert_comment(comment).await
        }

        async fn delete_comment(&self, comment_id: &str) -> FeedResult<()> {
            self.inner.delete_comment(comment_id).await
        }

        async fn upload_audio(&self, user_id: &str, upload: &AudioUpload) -> FeedResult<String> {
            self.inner.upload_audio(user_id, upload).await
        }
    }

    fn setup() -> (MemoryPlatform, OptimisticMutator, String) {
        let platform = MemoryPlatform::new();
        let me = platform.register("me@example.com", "pw", "Me");
        platform.sign_in_as(&me);
        let cache = QueryCache::new(platform.backend());
        let mutator = OptimisticMutator::new(platform.backend(), platform.session(), cache);
        (platform, mutator, me)
    }

    #[tokio::test]
    async fn toggle_applies_locally_before_the_write_lands() {
        let (platform, mutator, _) = setup();
        let other = platform.register("o@example.com", "pw", "Other");
        let post = platform.seed_post(&other, "loop");
        platform.seed_like(&other, &post);
        mutator.load_engagement(&post).await.unwrap();

        let toggle = mutator.toggle_like(&post).unwrap();
        assert_eq!(toggle.optimistic.state, LikeState::Liked);
        assert_eq!(toggle.optimistic.count, 2);
        assert!(toggle.optimistic.pending);

        let settled = toggle.settled().await.unwrap();
        assert_eq!(settled.count, 2);
        assert!(!settled.pending);
        assert_eq!(platform.like_count(&post), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_toggles_keep_order_and_parity() {
        let (platform, mutator, me) = setup();
        let post = platform.seed_post(&me, "loop");
        platform.set_write_delay(std::time::Duration::from_millis(20));

        let mut last = None;
        for _ in 0..5 {
            last = Some(mutator.toggle_like(&post).unwrap());
        }
        let settled = last.unwrap().settled().await.unwrap();

        assert_eq!(settled.state, LikeState::Liked);
        assert_eq!(settled.count, 1);
        assert_eq!(platform.reaction_writes(), 5);
        assert!(platform.has_liked(&me, &post));
    }

    #[tokio::test]
    async fn failed_write_reverts_to_confirmed_state() {
        let (platform, mutator, me) = setup();
        let post = platform.seed_post(&me, "loop");
        mutator.load_engagement(&post).await.unwrap();
        platform.fail_writes(true);

        let toggle = mutator.toggle_like(&post).unwrap();
        assert!(toggle.optimistic.liked());
        let err = toggle.settled().await.unwrap_err();
        assert!(matches!(err, FeedError::Network(_)));

        let view = mutator.engagement(&post).like;
        assert_eq!(view.state, LikeState::Unliked);
        assert_eq!(view.count, 0);
        assert!(view.error.is_some());
        assert!(!platform.has_liked(&me, &post));
    }

    #[tokio::test(start_paused = true)]
    async fn later_success_after_a_failed_write_is_not_an_error() {
        let (platform, mutator, me) = setup();
        let post = platform.seed_post(&me, "loop");
        mutator.load_engagement(&post).await.unwrap();
        platform.set_write_delay(Duration::from_millis(20));
        platform.fail_next_writes(1);

        // Like (fails), unlike (already the confirmed state), like again.
        mutator.toggle_like(&post).unwrap();
        mutator.toggle_like(&post).unwrap();
        let last = mutator.toggle_like(&post).unwrap();
        let settled = last.settled().await.unwrap();

        assert_eq!((settled.state, settled.count), (LikeState::Liked, 1));
        assert_eq!(settled.error, None);
        assert_eq!(mutator.engagement(&post).like.error, None);
        assert!(platform.has_liked(&me, &post));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_does_not_undo_a_settled_like() {
        let platform = MemoryPlatform::new();
        let me = platform.register("me@example.com", "pw", "Me");
        platform.sign_in_as(&me);
        let post = platform.seed_post(&me, "loop");
        let backend: Arc<dyn FeedBackend> = Arc::new(SlowSummary {
            inner: platform.backend(),
            hold: Duration::from_millis(100),
        });
        let mutator =
            OptimisticMutator::new(backend.clone(), platform.session(), QueryCache::new(backend));

        let load = tokio::spawn({
            let mutator = mutator.clone();
            let post = post.clone();
            async move { mutator.load_engagement(&post).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let liked = mutator.toggle_like(&post).unwrap().settled().await.unwrap();
        assert_eq!((liked.state, liked.count), (LikeState::Liked, 1));

        let loaded = load.await.unwrap().unwrap();
        assert!(loaded.loaded);
        assert_eq!((loaded.like.state, loaded.like.count), (LikeState::Liked, 1));
        assert_eq!(mutator.engagement(&post).like.state, LikeState::Liked);
        assert!(platform.has_liked(&me, &post));
    }

    #[tokio::test]
    async fn refresh_picks_up_other_users_activity() {
        let (platform, mutator, me) = setup();
        let other = platform.register("o@example.com", "pw", "Other");
        let watched = platform.seed_post(&me, "loop");
        let unwatched = platform.seed_post(&me, "other loop");
        mutator.load_engagement(&watched).await.unwrap();

        platform.seed_like(&other, &watched);
        platform.seed_comment(&other, &watched, "nice");
        platform.seed_like(&other, &unwatched);
        mutator.refresh_loaded().await;

        let view = mutator.engagement(&watched);
        assert_eq!(view.like.count, 1);
        assert_eq!(view.like.state, LikeState::Unliked);
        assert_eq!(view.comments.len(), 1);
        assert!(!mutator.engagement(&unwatched).loaded);
    }

    #[tokio::test]
    async fn empty_comment_is_rejected() {
        let (platform, mutator, me) = setup();
        let post = platform.seed_post(&me, "loop");
        let err = mutator.add_comment(&post, "   ").await.unwrap_err();
        assert_eq!(err, FeedError::validation("comment cannot be empty"));
        assert_eq!(platform.comment_count(&post), 0);
    }

    #[tokio::test]
    async fn added_comment_comes_back_with_server_fields() {
        let (platform, mutator, me) = setup();
        let post = platform.seed_post(&me, "loop");
        let engagement = mutator.add_comment(&post, "  fire  ").await.unwrap();
        assert_eq!(engagement.comments.len(), 1);
        assert_eq!(engagement.comments[0].content, "fire");
        assert_eq!(engagement.comments[0].author_name(), "Me");
        assert!(mutator.can_delete_comment(&engagement.comments[0]));
    }

    #[tokio::test]
    async fn declined_delete_sends_nothing() {
        let (platform, mutator, me) = setup();
        let post = platform.seed_post(&me, "loop");
        let outcome = mutator
            .delete_post(&post, Confirmation::Declined)
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::Declined);
        assert_eq!(platform.fetch_feed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_comment_cannot_be_deleted() {
        let (platform, mutator, _) = setup();
        let other = platform.register("o@example.com", "pw", "Other");
        let post = platform.seed_post(&other, "loop");
        let comment = platform.seed_comment(&other, &post, "mine");
        let before = mutator.load_engagement(&post).await.unwrap();
        assert!(!mutator.can_delete_comment(&before.comments[0]));

        let err = mutator
            .delete_comment(&post, &comment, Confirmation::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Forbidden(_)));
        assert_eq!(mutator.engagement(&post).comments, before.comments);
        assert_eq!(platform.comment_count(&post), 1);
    }

    #[tokio::test]
    async fn server_still_rejects_unknown_foreign_comment() {
        let (platform, mutator, _) = setup();
        let other = platform.register("o@example.com", "pw", "Other");
        let post = platform.seed_post(&other, "loop");
        let comment = platform.seed_comment(&other, &post, "mine");

        // Nothing loaded locally, so the local check cannot catch it.
        let err = mutator
            .delete_comment(&post, &comment, Confirmation::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Forbidden(_)));
        assert_eq!(platform.comment_count(&post), 1);
    }

    #[tokio::test]
    async fn create_post_uploads_audio_first() {
        let (platform, mutator, _) = setup();
        let upload = AudioUpload::new("sketch.wav", vec![0, 1, 2, 3]).unwrap();
        mutator.create_post("new sketch", Some(upload)).await.unwrap();

        let feed = platform.fetch_feed().await.unwrap();
        let url = feed[0].audio_url.clone().unwrap();
        assert!(url.ends_with(".wav"));
        let path = url.trim_start_matches("memory://audio-snippets/");
        assert_eq!(platform.stored_object(path), Some(vec![0, 1, 2, 3]));
    }

    #[tokio::test]
    async fn blank_post_is_rejected() {
        let (_, mutator, _) = setup();
        let err = mutator.create_post(" \n ", None).await.unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
    }

    #[tokio::test]
    async fn signed_out_toggle_is_an_auth_error() {
        let platform = MemoryPlatform::new();
        let cache = QueryCache::new(platform.backend());
        let mutator = OptimisticMutator::new(platform.backend(), platform.session(), cache);
        assert!(matches!(
            mutator.toggle_like("p1"),
            Err(FeedError::Auth(_))
        ));
    }
}
