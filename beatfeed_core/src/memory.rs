use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{audio_object_path, FeedBackend};
use crate::error::{FeedError, FeedResult};
use crate::models::{
    AudioUpload, AuthorProfile, Comment, LikeSummary, NewComment, NewPost, NewReaction, Post,
    Reaction, ReactionKind,
};
use crate::realtime::{ChangeChannel, ChangeEvent, ChangeKind, FeedTable, Subscription};
use crate::session::{
    validate_credentials, validate_new_password, validate_recovery, Authenticator, Session,
    SessionSource, SignUpOutcome,
};

const EVENT_BUFFER: usize = 64;
const AUDIO_URL_PREFIX: &str = "memory://audio-snippets";

#[derive(Debug, Clone)]
struct Account {
    user_id: String,
    email: String,
    password: String,
}

#[derive(Debug, Clone)]
struct PostRow {
    id: String,
    user_id: String,
    content: String,
    audio_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CommentRow {
    id: String,
    post_id: String,
    user_id: String,
    content: String,
    created_at: DateTime<Utc>,
}

struct Db {
    accounts: Vec<Account>,
    profiles: HashMap<String, AuthorProfile>,
    posts: Vec<PostRow>,
    comments: Vec<CommentRow>,
    reactions: Vec<Reaction>,
    objects: HashMap<String, Vec<u8>>,
    /// Outstanding recovery codes by email.
    reset_codes: HashMap<String, String>,
    epoch: DateTime<Utc>,
    ticks: i64,
}

impl Db {
    fn new() -> Self {
        Self {
            accounts: Vec::new(),
            profiles: HashMap::new(),
            posts: Vec::new(),
            comments: Vec::new(),
            reactions: Vec::new(),
            objects: HashMap::new(),
            reset_codes: HashMap::new(),
            epoch: Utc::now(),
            ticks: 0,
        }
    }

    /// Strictly increasing row timestamps.
    fn now(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        self.epoch + ChronoDuration::milliseconds(self.ticks)
    }

    fn profile(&self, user_id: &str) -> Option<AuthorProfile> {
        self.profiles.get(user_id).cloned()
    }

    fn post_exists(&self, post_id: &str) -> bool {
        self.posts.iter().any(|post| post.id == post_id)
    }
}

struct Subscriber {
    tables: Vec<FeedTable>,
    events: mpsc::Sender<ChangeEvent>,
    closer: CancellationToken,
}

struct Inner {
    db: Mutex<Db>,
    session: watch::Sender<Option<Session>>,
    subscribers: Mutex<Vec<Subscriber>>,
    read_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_next_writes: AtomicUsize,
    fail_subscribe: AtomicBool,
    feed_fetches: AtomicUsize,
    reaction_writes: AtomicUsize,
    subscriptions: AtomicUsize,
    reset_requests: AtomicUsize,
}

/// In-process stand-in for the hosted platform.
///
/// Implements every seam the sync core talks to: feed reads and writes, the
/// change channel, the session and the auth service. Rows keep the
/// platform's ownership rules and every write emits a change event, so the
/// demo shell and the tests run the same code paths as a live project.
#[derive(Clone)]
pub struct MemoryPlatform {
    inner: Arc<Inner>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                db: Mutex::new(Db::new()),
                session,
                subscribers: Mutex::new(Vec::new()),
                read_delay_ms: AtomicU64::new(0),
                write_delay_ms: AtomicU64::new(0),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                fail_next_writes: AtomicUsize::new(0),
                fail_subscribe: AtomicBool::new(false),
                feed_fetches: AtomicUsize::new(0),
                reaction_writes: AtomicUsize::new(0),
                subscriptions: AtomicUsize::new(0),
                reset_requests: AtomicUsize::new(0),
            }),
        }
    }

    pub fn backend(&self) -> Arc<dyn FeedBackend> {
        Arc::new(self.clone())
    }

    pub fn channel(&self) -> Arc<dyn ChangeChannel> {
        Arc::new(self.clone())
    }

    pub fn session(&self) -> Arc<dyn SessionSource> {
        Arc::new(self.clone())
    }

    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        Arc::new(self.clone())
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Db) -> T) -> T {
        let mut db = self.inner.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut db)
    }

    /// Creates a confirmed account with a profile and returns its user id.
    pub fn register(&self, email: &str, password: &str, display_name: &str) -> String {
        let user_id = Uuid::new_v4().to_string();
        self.with_db(|db| {
            db.accounts.push(Account {
                user_id: user_id.clone(),
                email: email.trim().to_lowercase(),
                password: password.to_string(),
            });
            db.profiles.insert(
                user_id.clone(),
                AuthorProfile {
                    display_name: Some(display_name.to_string()),
                    avatar_url: None,
                },
            );
        });
        user_id
    }

    /// Opens a session for an existing account without a password check.
    pub fn sign_in_as(&self, user_id: &str) {
        let email = self.with_db(|db| {
            db.accounts
                .iter()
                .find(|account| account.user_id == user_id)
                .map(|account| account.email.clone())
        });
        self.inner.session.send_replace(Some(session_for(user_id, email)));
    }

    /// Inserts a post as if another client wrote it, bypassing the session.
    pub fn seed_post(&self, author: &str, content: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.with_db(|db| {
            let created_at = Some(db.now());
            db.posts.push(PostRow {
                id: id.clone(),
                user_id: author.to_string(),
                content: content.to_string(),
                audio_url: None,
                created_at,
            });
        });
        self.emit(FeedTable::Posts, ChangeKind::Insert);
        id
    }

    pub fn seed_comment(&self, author: &str, post_id: &str, content: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.with_db(|db| {
            let created_at = db.now();
            db.comments.push(CommentRow {
                id: id.clone(),
                post_id: post_id.to_string(),
                user_id: author.to_string(),
                content: content.to_string(),
                created_at,
            });
        });
        self.emit(FeedTable::Comments, ChangeKind::Insert);
        id
    }

    pub fn seed_like(&self, user_id: &str, post_id: &str) {
        self.with_db(|db| {
            db.reactions.push(Reaction {
                id: Uuid::new_v4().to_string(),
                post_id: post_id.to_string(),
                user_id: user_id.to_string(),
                kind: ReactionKind::Like,
            });
        });
        self.emit(FeedTable::Reactions, ChangeKind::Insert);
    }

    /// A small catalogue of producers and loops for the demo shell.
    /// Returns the user id of the first producer; every account's password
    /// is `demo-pass`.
    pub fn seed_demo(&self) -> String {
        let kai = self.register("kai@beatfeed.dev", "demo-pass", "Kai");
        let mira = self.register("mira@beatfeed.dev", "demo-pass", "Mira");
        let theo = self.register("theo@beatfeed.dev", "demo-pass", "Theo");

        let first = self.seed_post(&mira, "Late night lo-fi sketch, 82 bpm. Thoughts?");
        let second = self.seed_post(&theo, "Chopped a soul sample into a drill loop");
        let third = self.seed_post(&kai, "Working on a new 808 pattern");

        self.seed_like(&kai, &first);
        self.seed_like(&theo, &first);
        self.seed_like(&mira, &third);
        self.seed_comment(&kai, &first, "That Rhodes voicing is lovely");
        self.seed_comment(&theo, &second, "Send stems?");
        kai
    }

    /// Emits a change event without touching any row.
    pub fn notify(&self, table: FeedTable, kind: ChangeKind) {
        self.emit(table, kind);
    }

    /// Drops every live subscription as if the socket died.
    pub fn disconnect_subscribers(&self) {
        let dropped = {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *subscribers)
        };
        tracing::debug!(count = dropped.len(), "disconnected memory subscribers");
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.inner
            .read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.inner
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fails the next `count` writes, then lets writes through again.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.fail_next_writes.store(count, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn feed_fetches(&self) -> usize {
        self.inner.feed_fetches.load(Ordering::SeqCst)
    }

    /// Reaction inserts and deletes attempted so far.
    pub fn reaction_writes(&self) -> usize {
        self.inner.reaction_writes.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    /// Subscriptions whose receiver is still alive.
    pub fn live_subscribers(&self) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sub| !sub.closer.is_cancelled() && !sub.events.is_closed());
        subscribers.len()
    }

    pub fn reset_requests(&self) -> usize {
        self.inner.reset_requests.load(Ordering::SeqCst)
    }

    /// The code the last reset email for `email` would carry.
    pub fn reset_code(&self, email: &str) -> Option<String> {
        let normalized = email.trim().to_lowercase();
        self.with_db(|db| db.reset_codes.get(&normalized).cloned())
    }

    pub fn like_count(&self, post_id: &str) -> usize {
        self.with_db(|db| {
            db.reactions
                .iter()
                .filter(|r| r.post_id == post_id && r.kind == ReactionKind::Like)
                .count()
        })
    }

    pub fn has_liked(&self, user_id: &str, post_id: &str) -> bool {
        self.with_db(|db| {
            db.reactions
                .iter()
                .any(|r| r.post_id == post_id && r.user_id == user_id && r.kind == ReactionKind::Like)
        })
    }

    pub fn comment_count(&self, post_id: &str) -> usize {
        self.with_db(|db| db.comments.iter().filter(|c| c.post_id == post_id).count())
    }

    pub fn stored_object(&self, path: &str) -> Option<Vec<u8>> {
        self.with_db(|db| db.objects.get(path).cloned())
    }

    fn emit(&self, table: FeedTable, kind: ChangeKind) {
        let event = ChangeEvent { table, kind };
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sub| !sub.closer.is_cancelled() && !sub.events.is_closed());
        for sub in subscribers.iter().filter(|sub| sub.tables.contains(&table)) {
            // A full queue already holds a pending refetch trigger.
            let _ = sub.events.try_send(event);
        }
    }

    async fn pause(&self, delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn before_read(&self) -> FeedResult<()> {
        self.pause(&self.inner.read_delay_ms).await;
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(FeedError::Network("memory platform: read failed".into()));
        }
        Ok(())
    }

    /// Applies the write delay and failure switch, then returns the signed-in user.
    async fn before_write(&self) -> FeedResult<String> {
        self.pause(&self.inner.write_delay_ms).await;
        let fail_next = self
            .inner
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_next || self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(FeedError::Network("memory platform: write failed".into()));
        }
        self.current_user_id()
            .ok_or_else(|| FeedError::Auth("not signed in".into()))
    }
}

fn session_for(user_id: &str, email: Option<String>) -> Session {
    Session {
        user_id: user_id.to_string(),
        email,
        access_token: format!("memory-token-{user_id}"),
        refresh_token: None,
        expires_at: None,
    }
}

fn row_policy(writer: &str, owner: &str) -> FeedResult<()> {
    if writer != owner {
        return Err(FeedError::Forbidden(
            "new row violates row-level security policy".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl FeedBackend for MemoryPlatform {
    async fn fetch_feed(&self) -> FeedResult<Vec<Post>> {
        self.inner.feed_fetches.fetch_add(1, Ordering::SeqCst);
        self.before_read().await?;
        let mut posts = self.with_db(|db| {
            db.posts
                .iter()
                .map(|row| Post {
                    id: row.id.clone(),
                    user_id: row.user_id.clone(),
                    content: row.content.clone(),
                    audio_url: row.audio_url.clone(),
                    created_at: row.created_at,
                    author: db.profile(&row.user_id),
                })
                .collect::<Vec<_>>()
        });
        posts.reverse();
        Ok(posts)
    }

    async fn like_summary(&self, post_id: &str, user_id: &str) -> FeedResult<LikeSummary> {
        self.before_read().await?;
        Ok(self.with_db(|db| {
            let likes = db
                .reactions
                .iter()
                .filter(|r| r.post_id == post_id && r.kind == ReactionKind::Like);
            let mut summary = LikeSummary::default();
            for reaction in likes {
                summary.count += 1;
                summary.liked_by_me |= reaction.user_id == user_id;
            }
            summary
        }))
    }

    async fn list_comments(&self, post_id: &str) -> FeedResult<Vec<Comment>> {
        self.before_read().await?;
        Ok(self.with_db(|db| {
            let mut comments: Vec<Comment> = db
                .comments
                .iter()
                .filter(|row| row.post_id == post_id)
                .map(|row| Comment {
                    id: row.id.clone(),
                    post_id: row.post_id.clone(),
                    user_id: row.user_id.clone(),
                    content: row.content.clone(),
                    created_at: row.created_at,
                    author: db.profile(&row.user_id),
                })
                .collect();
            comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            comments
        }))
    }

    async fn insert_post(&self, post: &NewPost) -> FeedResult<()> {
        let writer = self.before_write().await?;
        row_policy(&writer, &post.user_id)?;
        self.with_db(|db| {
            let created_at = Some(db.now());
            db.posts.push(PostRow {
                id: Uuid::new_v4().to_string(),
                user_id: post.user_id.clone(),
                content: post.content.clone(),
                audio_url: post.audio_url.clone(),
                created_at,
            });
        });
        self.emit(FeedTable::Posts, ChangeKind::Insert);
        Ok(())
    }

    async fn delete_post(&self, post_id: &str) -> FeedResult<()> {
        let writer = self.before_write().await?;
        let deleted = self.with_db(|db| {
            let Some(index) = db
                .posts
                .iter()
                .position(|post| post.id == post_id && post.user_id == writer)
            else {
                return false;
            };
            db.posts.remove(index);
            db.comments.retain(|comment| comment.post_id != post_id);
            db.reactions.retain(|reaction| reaction.post_id != post_id);
            true
        });
        if !deleted {
            return Err(FeedError::Forbidden(format!(
                "post {post_id} was not deleted; only its author can remove it"
            )));
        }
        self.emit(FeedTable::Posts, ChangeKind::Delete);
        Ok(())
    }

    async fn insert_reaction(&self, reaction: &NewReaction) -> FeedResult<()> {
        self.inner.reaction_writes.fetch_add(1, Ordering::SeqCst);
        let writer = self.before_write().await?;
        row_policy(&writer, &reaction.user_id)?;
        self.with_db(|db| {
            if !db.post_exists(&reaction.post_id) {
                return Err(FeedError::Validation(format!(
                    "post {} does not exist",
                    reaction.post_id
                )));
            }
            let duplicate = db.reactions.iter().any(|r| {
                r.post_id == reaction.post_id && r.user_id == reaction.user_id && r.kind == reaction.kind
            });
            if duplicate {
                return Err(FeedError::Conflict(
                    "duplicate key value violates unique constraint".into(),
                ));
            }
            db.reactions.push(Reaction {
                id: Uuid::new_v4().to_string(),
                post_id: reaction.post_id.clone(),
                user_id: reaction.user_id.clone(),
                kind: reaction.kind,
            });
            Ok(())
        })?;
        self.emit(FeedTable::Reactions, ChangeKind::Insert);
        Ok(())
    }

    async fn delete_reaction(&self, post_id: &str, user_id: &str, kind: ReactionKind) -> FeedResult<()> {
        self.inner.reaction_writes.fetch_add(1, Ordering::SeqCst);
        let writer = self.before_write().await?;
        let removed = self.with_db(|db| {
            let before = db.reactions.len();
            db.reactions.retain(|r| {
                !(r.post_id == post_id && r.user_id == user_id && r.user_id == writer && r.kind == kind)
            });
            before - db.reactions.len()
        });
        if removed > 0 {
            self.emit(FeedTable::Reactions, ChangeKind::Delete);
        }
        Ok(())
    }

    async fn insert_comment(&self, comment: &NewComment) -> FeedResult<()> {
        let writer = self.before_write().await?;
        row_policy(&writer, &comment.user_id)?;
        self.with_db(|db| {
            if !db.post_exists(&comment.post_id) {
                return Err(FeedError::Validation(format!(
                    "post {} does not exist",
                    comment.post_id
                )));
            }
            let created_at = db.now();
            db.comments.push(CommentRow {
                id: Uuid::new_v4().to_string(),
                post_id: comment.post_id.clone(),
                user_id: comment.user_id.clone(),
                content: comment.content.clone(),
                created_at,
            });
            Ok(())
        })?;
        self.emit(FeedTable::Comments, ChangeKind::Insert);
        Ok(())
    }

    async fn delete_comment(&self, comment_id: &str) -> FeedResult<()> {
        let writer = self.before_write().await?;
        let deleted = self.with_db(|db| {
            let before = db.comments.len();
            db.comments
                .retain(|comment| !(comment.id == comment_id && comment.user_id == writer));
            before != db.comments.len()
        });
        if !deleted {
            return Err(FeedError::Forbidden(format!(
                "comment {comment_id} was not deleted; only its author can remove it"
            )));
        }
        self.emit(FeedTable::Comments, ChangeKind::Delete);
        Ok(())
    }

    async fn upload_audio(&self, user_id: &str, upload: &AudioUpload) -> FeedResult<String> {
        let writer = self.before_write().await?;
        row_policy(&writer, user_id)?;
        let path = audio_object_path(user_id, upload);
        self.with_db(|db| db.objects.insert(path.clone(), upload.bytes.clone()));
        Ok(format!("{AUDIO_URL_PREFIX}/{path}"))
    }
}

#[async_trait]
impl ChangeChannel for MemoryPlatform {
    async fn subscribe(
        &self,
        tables: &[FeedTable],
        _access_token: Option<String>,
    ) -> FeedResult<Subscription> {
        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(FeedError::Network("memory platform: subscribe failed".into()));
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let closer = CancellationToken::new();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                tables: tables.to_vec(),
                events: tx,
                closer: closer.clone(),
            });
        Ok(Subscription::new(rx, closer))
    }
}

#[async_trait]
impl SessionSource for MemoryPlatform {
    fn current(&self) -> Option<Session> {
        self.inner.session.borrow().clone()
    }

    async fn access_token(&self) -> FeedResult<Option<String>> {
        Ok(self.current().map(|session| session.access_token))
    }

    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.inner.session.subscribe()
    }
}

#[async_trait]
impl Authenticator for MemoryPlatform {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> FeedResult<SignUpOutcome> {
        validate_credentials(email, password)?;
        if display_name.trim().is_empty() {
            return Err(FeedError::validation("display name is required"));
        }
        let normalized = email.trim().to_lowercase();
        let taken = self.with_db(|db| db.accounts.iter().any(|a| a.email == normalized));
        if taken {
            return Err(FeedError::Auth("User already registered".into()));
        }
        let user_id = self.register(&normalized, password, display_name.trim());
        let session = session_for(&user_id, Some(normalized));
        self.inner.session.send_replace(Some(session.clone()));
        Ok(SignUpOutcome::SignedIn(session))
    }

    async fn sign_in(&self, email: &str, password: &str) -> FeedResult<Session> {
        validate_credentials(email, password)?;
        let normalized = email.trim().to_lowercase();
        let account = self.with_db(|db| {
            db.accounts
                .iter()
                .find(|a| a.email == normalized && a.password == password)
                .cloned()
        });
        let account =
            account.ok_or_else(|| FeedError::Auth("Invalid login credentials".into()))?;
        let session = session_for(&account.user_id, Some(account.email));
        self.inner.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> FeedResult<()> {
        self.inner.session.send_replace(None);
        Ok(())
    }

    async fn request_password_reset(&self, email: &str) -> FeedResult<()> {
        if email.trim().is_empty() {
            return Err(FeedError::validation("enter your email first"));
        }
        self.inner.reset_requests.fetch_add(1, Ordering::SeqCst);
        let normalized = email.trim().to_lowercase();
        let code = format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000);
        self.with_db(|db| {
            // Unknown addresses get no code but the same answer.
            if db.accounts.iter().any(|a| a.email == normalized) {
                db.reset_codes.insert(normalized, code);
            }
        });
        Ok(())
    }

    async fn verify_recovery(&self, email: &str, code: &str) -> FeedResult<Session> {
        validate_recovery(email, code)?;
        let normalized = email.trim().to_lowercase();
        let account = self.with_db(|db| {
            if db.reset_codes.get(&normalized).map(String::as_str) != Some(code.trim()) {
                return None;
            }
            db.reset_codes.remove(&normalized);
            db.accounts.iter().find(|a| a.email == normalized).cloned()
        });
        let account =
            account.ok_or_else(|| FeedError::Auth("Token has expired or is invalid".into()))?;
        let session = session_for(&account.user_id, Some(account.email));
        self.inner.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    async fn update_password(&self, password: &str, confirm: &str) -> FeedResult<()> {
        validate_new_password(password, confirm)?;
        let user_id = self
            .current_user_id()
            .ok_or_else(|| FeedError::Auth("verify the reset code or sign in first".into()))?;
        self.with_db(|db| {
            if let Some(account) = db.accounts.iter_mut().find(|a| a.user_id == user_id) {
                account.password = password.to_string();
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn sign_up_opens_a_session() {
        let platform = MemoryPlatform::new();
        let outcome = platform
            .sign_up("Kai@Example.com", "secret", "Kai")
            .await
            .unwrap();
        let SignUpOutcome::SignedIn(session) = outcome else {
            panic!("memory sign-up confirms immediately");
        };
        assert_eq!(platform.current_user_id(), Some(session.user_id));

        let again = platform.sign_up("kai@example.com", "other", "Kai").await;
        assert!(matches!(again, Err(FeedError::Auth(_))));
    }

    #[tokio::test]
    async fn recovery_code_opens_a_session_once() {
        let platform = MemoryPlatform::new();
        let kai = platform.register("kai@example.com", "secret", "Kai");
        platform.request_password_reset("Kai@example.com").await.unwrap();
        let code = platform.reset_code("kai@example.com").unwrap();
        assert_eq!(code.len(), 6);

        let err = platform
            .verify_recovery("kai@example.com", "not-it")
            .await
            .unwrap_err();
        assert_eq!(err, FeedError::Auth("Token has expired or is invalid".into()));
        assert_eq!(platform.current_user_id(), None);

        let session = platform.verify_recovery("kai@example.com", &code).await.unwrap();
        assert_eq!(session.user_id, kai);
        assert_eq!(platform.current_user_id(), Some(kai));
        platform.update_password("fresh-one", "fresh-one").await.unwrap();
        platform.sign_out().await.unwrap();
        assert!(platform.sign_in("kai@example.com", "fresh-one").await.is_ok());

        assert!(platform.verify_recovery("kai@example.com", &code).await.is_err());
    }

    #[tokio::test]
    async fn reset_for_unknown_email_issues_no_code() {
        let platform = MemoryPlatform::new();
        platform.request_password_reset("ghost@example.com").await.unwrap();
        assert_eq!(platform.reset_requests(), 1);
        assert_eq!(platform.reset_code("ghost@example.com"), None);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let platform = MemoryPlatform::new();
        platform.register("kai@example.com", "secret", "Kai");
        let err = platform.sign_in("kai@example.com", "nope").await.unwrap_err();
        assert_eq!(err, FeedError::Auth("Invalid login credentials".into()));
        assert!(platform.sign_in("kai@example.com", "secret").await.is_ok());
    }

    #[tokio::test]
    async fn rows_belong_to_the_session_user() {
        let platform = MemoryPlatform::new();
        let kai = platform.register("kai@example.com", "pw", "Kai");
        let mira = platform.register("mira@example.com", "pw", "Mira");
        platform.sign_in_as(&kai);

        let spoofed = NewPost {
            content: "not mine".into(),
            audio_url: None,
            user_id: mira.clone(),
        };
        assert!(matches!(
            platform.insert_post(&spoofed).await,
            Err(FeedError::Forbidden(_))
        ));

        let post_id = platform.seed_post(&mira, "mira's loop");
        assert!(matches!(
            platform.delete_post(&post_id).await,
            Err(FeedError::Forbidden(_))
        ));
        assert_eq!(platform.fetch_feed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_like_conflicts() {
        let platform = MemoryPlatform::new();
        let kai = platform.register("kai@example.com", "pw", "Kai");
        platform.sign_in_as(&kai);
        let post_id = platform.seed_post(&kai, "loop");
        let like = NewReaction {
            post_id: post_id.clone(),
            user_id: kai.clone(),
            kind: ReactionKind::Like,
        };

        platform.insert_reaction(&like).await.unwrap();
        assert!(matches!(
            platform.insert_reaction(&like).await,
            Err(FeedError::Conflict(_))
        ));
        assert_eq!(platform.like_count(&post_id), 1);
        assert_eq!(platform.reaction_writes(), 2);
    }

    #[tokio::test]
    async fn deleting_a_post_cascades() {
        let platform = MemoryPlatform::new();
        let kai = platform.register("kai@example.com", "pw", "Kai");
        let mira = platform.register("mira@example.com", "pw", "Mira");
        platform.sign_in_as(&kai);
        let post_id = platform.seed_post(&kai, "loop");
        platform.seed_comment(&mira, &post_id, "nice");
        platform.seed_like(&mira, &post_id);

        platform.delete_post(&post_id).await.unwrap();
        assert_eq!(platform.comment_count(&post_id), 0);
        assert_eq!(platform.like_count(&post_id), 0);
    }

    #[tokio::test]
    async fn writes_notify_matching_subscribers() {
        let platform = MemoryPlatform::new();
        let kai = platform.register("kai@example.com", "pw", "Kai");
        platform.sign_in_as(&kai);
        let mut posts_only = platform.subscribe(&[FeedTable::Posts], None).await.unwrap();
        let mut comments_only = platform
            .subscribe(&[FeedTable::Comments], None)
            .await
            .unwrap();

        platform
            .insert_post(&NewPost {
                content: "hello".into(),
                audio_url: None,
                user_id: kai.clone(),
            })
            .await
            .unwrap();

        assert_eq!(
            posts_only.next().await,
            Some(ChangeEvent {
                table: FeedTable::Posts,
                kind: ChangeKind::Insert,
            })
        );
        assert_eq!(comments_only.drain(), 0);

        platform.disconnect_subscribers();
        assert_eq!(posts_only.next().await, None);
    }

    #[tokio::test]
    async fn feed_carries_author_profiles_newest_first() {
        let platform = MemoryPlatform::new();
        let kai = platform.register("kai@example.com", "pw", "Kai");
        platform.seed_post(&kai, "first");
        platform.seed_post("ghost", "second");

        let feed = platform.fetch_feed().await.unwrap();
        assert_eq!(feed[0].content, "second");
        assert_eq!(feed[0].author_name(), crate::models::UNKNOWN_AUTHOR);
        assert_eq!(feed[1].author_name(), "Kai");
        assert!(feed[0].created_at > feed[1].created_at);
    }
}
