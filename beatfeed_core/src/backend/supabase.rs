use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::graphql::{GraphqlResponse, FEED_QUERY};
use super::{audio_object_path, FeedBackend};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::models::{
    AudioUpload, Comment, LikeSummary, NewComment, NewPost, NewReaction, Post, ReactionKind,
};
use crate::session::SessionSource;

const COMMENT_COLUMNS: &str =
    "id,post_id,content,created_at,user_id,profiles(display_name,avatar_url)";

/// Platform client: GraphQL for the feed, PostgREST for engagement rows,
/// Storage for audio files.
#[derive(Clone)]
pub struct SupabaseBackend {
    config: FeedConfig,
    client: Client,
    session: Arc<dyn SessionSource>,
}

#[derive(Debug, Deserialize)]
struct ReactionRow {
    user_id: String,
}

impl SupabaseBackend {
    pub fn new(config: FeedConfig, session: Arc<dyn SessionSource>) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| FeedError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            config,
            client,
            session,
        })
    }

    /// Attaches `apikey` plus a bearer token fetched now, falling back to
    /// the anon key for signed-out reads.
    async fn authorize(&self, request: RequestBuilder) -> FeedResult<RequestBuilder> {
        let token = self
            .session
            .access_token()
            .await?
            .unwrap_or_else(|| self.config.anon_key.clone());
        Ok(request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token))
    }

    async fn execute(&self, request: RequestBuilder) -> FeedResult<Response> {
        let response = self.authorize(request).await?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            return Err(FeedError::from_status(status, &body));
        }
        Ok(response)
    }

    async fn insert_row<T: serde::Serialize + Sync>(&self, table: &str, row: &T) -> FeedResult<()> {
        let request = self
            .client
            .post(self.config.rest_url(table))
            .header("Prefer", "return=minimal")
            .json(row);
        self.execute(request).await?;
        Ok(())
    }

    /// Deletes matching rows and returns how many the row-level policy let through.
    async fn delete_rows(&self, table: &str, filters: &[(&str, String)]) -> FeedResult<usize> {
        let request = self
            .client
            .delete(self.config.rest_url(table))
            .header("Prefer", "return=representation")
            .query(&[("select", "id")])
            .query(filters);
        let deleted: Vec<serde_json::Value> = self.execute(request).await?.json().await?;
        Ok(deleted.len())
    }
}

#[async_trait]
impl FeedBackend for SupabaseBackend {
    async fn fetch_feed(&self) -> FeedResult<Vec<Post>> {
        let request = self
            .client
            .post(self.config.graphql_url())
            .json(&json!({ "query": FEED_QUERY }));
        let response: GraphqlResponse = self.execute(request).await?.json().await?;
        let posts = response.into_posts()?;
        tracing::debug!(count = posts.len(), "fetched feed");
        Ok(posts)
    }

    async fn like_summary(&self, post_id: &str, user_id: &str) -> FeedResult<LikeSummary> {
        let request = self.client.get(self.config.rest_url("reactions")).query(&[
            ("select", "id,user_id".to_string()),
            ("post_id", format!("eq.{post_id}")),
            ("type", format!("eq.{}", ReactionKind::Like.as_str())),
        ]);
        let rows: Vec<ReactionRow> = self.execute(request).await?.json().await?;
        Ok(LikeSummary {
            count: rows.len() as u32,
            liked_by_me: rows.iter().any(|row| row.user_id == user_id),
        })
    }

    async fn list_comments(&self, post_id: &str) -> FeedResult<Vec<Comment>> {
        let request = self.client.get(self.config.rest_url("comments")).query(&[
            ("select", COMMENT_COLUMNS.to_string()),
            ("post_id", format!("eq.{post_id}")),
            ("order", "created_at.asc".to_string()),
        ]);
        Ok(self.execute(request).await?.json().await?)
    }

    async fn insert_post(&self, post: &NewPost) -> FeedResult<()> {
        self.insert_row("posts", post).await
    }

    async fn delete_post(&self, post_id: &str) -> FeedResult<()> {
        let deleted = self
            .delete_rows("posts", &[("id", format!("eq.{post_id}"))])
            .await?;
        if deleted == 0 {
            return Err(FeedError::Forbidden(format!(
                "post {post_id} was not deleted; only its author can remove it"
            )));
        }
        Ok(())
    }

    async fn insert_reaction(&self, reaction: &NewReaction) -> FeedResult<()> {
        self.insert_row("reactions", reaction).await
    }

    async fn delete_reaction(&self, post_id: &str, user_id: &str, kind: ReactionKind) -> FeedResult<()> {
        let deleted = self
            .delete_rows(
                "reactions",
                &[
                    ("post_id", format!("eq.{post_id}")),
                    ("user_id", format!("eq.{user_id}")),
                    ("type", format!("eq.{}", kind.as_str())),
                ],
            )
            .await?;
        if deleted == 0 {
            tracing::debug!(post_id, "no reaction row to remove");
        }
        Ok(())
    }

    async fn insert_comment(&self, comment: &NewComment) -> FeedResult<()> {
        self.insert_row("comments", comment).await
    }

    async fn delete_comment(&self, comment_id: &str) -> FeedResult<()> {
        let deleted = self
            .delete_rows("comments", &[("id", format!("eq.{comment_id}"))])
            .await?;
        if deleted == 0 {
            return Err(FeedError::Forbidden(format!(
                "comment {comment_id} was not deleted; only its author can remove it"
            )));
        }
        Ok(())
    }

    async fn upload_audio(&self, user_id: &str, upload: &AudioUpload) -> FeedResult<String> {
        let object_path = audio_object_path(user_id, upload);
        let request = self
            .client
            .post(self.config.storage_object_url(&object_path))
            .header("Content-Type", &upload.content_type)
            .header("x-upsert", "false")
            .body(upload.bytes.clone());
        self.execute(request).await?;
        tracing::info!(path = %object_path, size = upload.bytes.len(), "uploaded audio");
        Ok(self.config.public_object_url(&object_path))
    }
}
