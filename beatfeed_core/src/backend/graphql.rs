use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{FeedError, FeedResult};
use crate::models::{AuthorProfile, Post};

/// The single read query behind the feed.
pub const FEED_QUERY: &str = r#"
  query GetFeed {
    postsCollection(orderBy: { created_at: DescNullsFirst }) {
      edges {
        node {
          id
          content
          audio_url
          created_at
          user_id
          profiles {
            display_name
            avatar_url
          }
        }
      }
    }
  }
"#;

#[derive(Debug, Deserialize)]
pub(super) struct GraphqlResponse {
    #[serde(default)]
    data: Option<FeedData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedData {
    #[serde(default)]
    posts_collection: Option<Connection>,
}

#[derive(Debug, Deserialize)]
struct Connection {
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: PostNode,
}

#[derive(Debug, Deserialize)]
struct PostNode {
    id: String,
    content: String,
    #[serde(default)]
    audio_url: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    user_id: String,
    #[serde(default)]
    profiles: Option<AuthorProfile>,
}

impl GraphqlResponse {
    pub(super) fn into_posts(self) -> FeedResult<Vec<Post>> {
        if !self.errors.is_empty() {
            let message = self
                .errors
                .into_iter()
                .map(|err| err.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(FeedError::Network(format!("feed query failed: {message}")));
        }
        let posts = self
            .data
            .and_then(|data| data.posts_collection)
            .map(|connection| connection.edges)
            .unwrap_or_default()
            .into_iter()
            .map(|edge| Post {
                id: edge.node.id,
                user_id: edge.node.user_id,
                content: edge.node.content,
                audio_url: edge.node.audio_url,
                created_at: edge.node.created_at,
                author: edge.node.profiles,
            })
            .collect();
        Ok(posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn edges_flatten_into_posts() {
        let raw = r#"{
            "data": { "postsCollection": { "edges": [
                { "node": {
                    "id": "p2", "content": "Hello", "audio_url": null,
                    "created_at": "2024-06-02T08:00:00+00:00", "user_id": "a",
                    "profiles": { "display_name": "Ada", "avatar_url": null }
                } },
                { "node": {
                    "id": "p1", "content": "beat", "audio_url": "https://cdn/x.mp3",
                    "created_at": null, "user_id": "b", "profiles": null
                } }
            ] } }
        }"#;
        let response: GraphqlResponse = serde_json::from_str(raw).unwrap();
        let posts = response.into_posts().unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].content, "Hello");
        assert_eq!(posts[0].author_name(), "Ada");
        assert_eq!(posts[1].audio_url.as_deref(), Some("https://cdn/x.mp3"));
        assert_eq!(posts[1].created_at, None);
    }

    #[test]
    fn graphql_errors_become_network_failures() {
        let raw = r#"{ "data": null, "errors": [{ "message": "permission denied" }] }"#;
        let response: GraphqlResponse = serde_json::from_str(raw).unwrap();
        let err = response.into_posts().unwrap_err();
        assert_eq!(
            err,
            FeedError::Network("feed query failed: permission denied".into())
        );
    }

    #[test]
    fn empty_collection_is_an_empty_feed() {
        let response: GraphqlResponse =
            serde_json::from_str(r#"{ "data": { "postsCollection": null } }"#).unwrap();
        assert!(response.into_posts().unwrap().is_empty());
    }
}
