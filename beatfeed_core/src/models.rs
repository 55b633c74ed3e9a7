use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FeedError, FeedResult};

pub const UNKNOWN_AUTHOR: &str = "Unknown Producer";
const AVATAR_FALLBACK_SEED: &str = "Producer";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    /// Missing timestamps sort first in the feed.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "profiles")]
    pub author: Option<AuthorProfile>,
}

impl Post {
    pub fn author_name(&self) -> &str {
        display_name(self.author.as_ref()).unwrap_or(UNKNOWN_AUTHOR)
    }

    pub fn avatar_url(&self) -> String {
        avatar_url(self.author.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "profiles")]
    pub author: Option<AuthorProfile>,
}

impl Comment {
    pub fn author_name(&self) -> &str {
        display_name(self.author.as_ref()).unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    #[default]
    Like,
}

impl ReactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionKind::Like => "like",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: ReactionKind,
}

/// Row payload for `posts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPost {
    pub content: String,
    pub audio_url: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewReaction {
    pub post_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: ReactionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewComment {
    pub post_id: String,
    pub user_id: String,
    pub content: String,
}

/// Aggregate like state of one post as seen by one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LikeSummary {
    pub count: u32,
    pub liked_by_me: bool,
}

/// An audio file chosen for upload alongside a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl AudioUpload {
    /// Builds an upload from raw bytes, rejecting anything that is not `audio/*`.
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> FeedResult<Self> {
        let file_name = file_name.into();
        let content_type = audio_content_type(&file_name).ok_or_else(|| {
            FeedError::validation(format!("{file_name} is not a supported audio file"))
        })?;
        if bytes.is_empty() {
            return Err(FeedError::validation(format!("{file_name} is empty")));
        }
        Ok(Self {
            file_name,
            content_type: content_type.to_string(),
            bytes,
        })
    }

    pub async fn from_path(path: &Path) -> FeedResult<Self> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| FeedError::validation(format!("invalid file path {}", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| FeedError::validation(format!("cannot read {}: {err}", path.display())))?;
        Self::new(file_name, bytes)
    }

    pub fn extension(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("bin")
    }
}

fn audio_content_type(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "aif" | "aiff" => "audio/aiff",
        "webm" => "audio/webm",
        _ => return None,
    };
    Some(mime)
}

fn display_name(profile: Option<&AuthorProfile>) -> Option<&str> {
    profile
        .and_then(|p| p.display_name.as_deref())
        .filter(|name| !name.trim().is_empty())
}

/// Avatar URL, falling back to a generated one seeded by the display name.
pub fn avatar_url(profile: Option<&AuthorProfile>) -> String {
    if let Some(url) = profile
        .and_then(|p| p.avatar_url.as_deref())
        .filter(|url| !url.is_empty())
    {
        return url.to_string();
    }
    let seed = display_name(profile).unwrap_or(AVATAR_FALLBACK_SEED);
    format!("https://api.dicebear.com/9.x/thumbs/png?seed={seed}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn post_decodes_rest_shape_with_profile() {
        let raw = r#"{
            "id": "p1",
            "user_id": "u1",
            "content": "new loop",
            "audio_url": null,
            "created_at": "2024-05-01T10:00:00.123456+00:00",
            "profiles": { "display_name": "Kai", "avatar_url": null }
        }"#;
        let post: Post = serde_json::from_str(raw).unwrap();
        assert_eq!(post.author_name(), "Kai");
        assert_eq!(post.audio_url, None);
        assert_eq!(
            post.avatar_url(),
            "https://api.dicebear.com/9.x/thumbs/png?seed=Kai"
        );
    }

    #[test]
    fn missing_profile_uses_fallbacks() {
        let raw = r#"{ "id": "p1", "user_id": "u1", "content": "x" }"#;
        let post: Post = serde_json::from_str(raw).unwrap();
        assert_eq!(post.created_at, None);
        assert_eq!(post.author_name(), UNKNOWN_AUTHOR);
        assert_eq!(
            post.avatar_url(),
            "https://api.dicebear.com/9.x/thumbs/png?seed=Producer"
        );
    }

    #[test]
    fn reaction_payload_uses_type_column() {
        let payload = NewReaction {
            post_id: "p1".into(),
            user_id: "u1".into(),
            kind: ReactionKind::Like,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "post_id": "p1", "user_id": "u1", "type": "like" })
        );
    }

    #[test]
    fn audio_upload_accepts_only_audio() {
        let upload = AudioUpload::new("Beat.Final.MP3", vec![1, 2, 3]).unwrap();
        assert_eq!(upload.content_type, "audio/mpeg");
        assert_eq!(upload.extension(), "MP3");

        assert!(matches!(
            AudioUpload::new("cover.png", vec![1]),
            Err(FeedError::Validation(_))
        ));
        assert!(matches!(
            AudioUpload::new("empty.wav", Vec::new()),
            Err(FeedError::Validation(_))
        ));
    }
}
