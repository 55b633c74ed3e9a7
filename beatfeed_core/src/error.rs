use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced by the feed core. None of them are fatal: callers keep
/// running after any single operation fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// A read, write or upload did not complete.
    #[error("network failure: {0}")]
    Network(String),
    /// Missing or expired session, or rejected credentials.
    #[error("authentication failure: {0}")]
    Auth(String),
    /// A required field was empty or malformed.
    #[error("{0}")]
    Validation(String),
    /// The platform refused a write because it would duplicate a row.
    #[error("conflicting write: {0}")]
    Conflict(String),
    /// The platform's row-level policy rejected the operation.
    #[error("not permitted: {0}")]
    Forbidden(String),
    /// The operation was torn down before its result could be applied.
    #[error("operation cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
}

pub type FeedResult<T> = Result<T, FeedError>;

impl FeedError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Maps a non-success HTTP status (plus the response body) onto the taxonomy.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = if body.trim().is_empty() {
            status.to_string()
        } else {
            format!("{status} - {}", body.trim())
        };
        match status {
            StatusCode::UNAUTHORIZED => Self::Auth(detail),
            StatusCode::FORBIDDEN => Self::Forbidden(detail),
            StatusCode::CONFLICT => Self::Conflict(detail),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Self::Validation(detail),
            _ => Self::Network(detail),
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::from_status(status, ""),
            None if err.is_decode() => Self::Network(format!("invalid response: {err}")),
            None => Self::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Network(format!("invalid response: {err}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(format!("realtime channel: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_taxonomy() {
        assert!(matches!(
            FeedError::from_status(StatusCode::UNAUTHORIZED, "jwt expired"),
            FeedError::Auth(_)
        ));
        assert!(matches!(
            FeedError::from_status(StatusCode::CONFLICT, ""),
            FeedError::Conflict(_)
        ));
        assert!(matches!(
            FeedError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            FeedError::Network(_)
        ));
    }

    #[test]
    fn validation_message_is_shown_verbatim() {
        let err = FeedError::validation("comment cannot be empty");
        assert_eq!(err.to_string(), "comment cannot be empty");
    }

    #[test]
    fn status_detail_includes_body() {
        let err = FeedError::from_status(StatusCode::FORBIDDEN, " row-level security ");
        assert_eq!(
            err.to_string(),
            "not permitted: 403 Forbidden - row-level security"
        );
    }
}
