mod graphql;
mod supabase;

use async_trait::async_trait;

use crate::error::FeedResult;
use crate::models::{AudioUpload, Comment, LikeSummary, NewComment, NewPost, NewReaction, Post, ReactionKind};

pub use graphql::FEED_QUERY;
pub use supabase::SupabaseBackend;

/// Read and write paths of the hosted platform. Ownership rules are enforced
/// on the other side: a delete of someone else's row fails with
/// [`FeedError::Forbidden`](crate::error::FeedError::Forbidden).
#[async_trait]
pub trait FeedBackend: Send + Sync {
    /// Posts with author profile fields, newest first.
    async fn fetch_feed(&self) -> FeedResult<Vec<Post>>;

    async fn like_summary(&self, post_id: &str, user_id: &str) -> FeedResult<LikeSummary>;

    /// Comments of one post, oldest first.
    async fn list_comments(&self, post_id: &str) -> FeedResult<Vec<Comment>>;

    async fn insert_post(&self, post: &NewPost) -> FeedResult<()>;

    async fn delete_post(&self, post_id: &str) -> FeedResult<()>;

    async fn insert_reaction(&self, reaction: &NewReaction) -> FeedResult<()>;

    /// Removes the user's reaction of `kind`; deleting an absent reaction is not an error.
    async fn delete_reaction(&self, post_id: &str, user_id: &str, kind: ReactionKind) -> FeedResult<()>;

    async fn insert_comment(&self, comment: &NewComment) -> FeedResult<()>;

    async fn delete_comment(&self, comment_id: &str) -> FeedResult<()>;

    /// Stores the file and returns its public URL.
    async fn upload_audio(&self, user_id: &str, upload: &AudioUpload) -> FeedResult<String>;
}

/// Object key for an upload: `<user_id>/<random>.<ext>`.
pub fn audio_object_path(user_id: &str, upload: &AudioUpload) -> String {
    format!("{user_id}/{}.{}", uuid::Uuid::new_v4(), upload.extension())
}
