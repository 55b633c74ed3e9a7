use reqwest::Url;
use std::env;
use std::time::Duration;

use crate::error::{FeedError, FeedResult};

pub const DEFAULT_AUDIO_BUCKET: &str = "audio-snippets";

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub supabase_url: String,
    /// Public anon key sent as `apikey` on every request.
    pub anon_key: String,
    /// Storage bucket that receives audio uploads.
    pub audio_bucket: String,
    pub request_timeout: Duration,
    /// Pause before the change listener re-subscribes after a disconnect.
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Where password-reset emails send the user back to.
    pub reset_redirect_url: Option<String>,
}

impl FeedConfig {
    pub fn new(supabase_url: impl Into<String>, anon_key: impl Into<String>) -> FeedResult<Self> {
        let anon_key = anon_key.into();
        if anon_key.trim().is_empty() {
            return Err(FeedError::Config("anon key must not be empty".into()));
        }
        Ok(Self {
            supabase_url: sanitize_base_url(supabase_url.into())?,
            anon_key,
            audio_bucket: DEFAULT_AUDIO_BUCKET.to_string(),
            request_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            reset_redirect_url: None,
        })
    }

    pub fn from_env() -> FeedResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> FeedResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|raw| !raw.trim().is_empty());

        let url = non_empty("BEATFEED_SUPABASE_URL")
            .ok_or_else(|| FeedError::Config("BEATFEED_SUPABASE_URL is not set".into()))?;
        let anon_key = non_empty("BEATFEED_SUPABASE_ANON_KEY")
            .ok_or_else(|| FeedError::Config("BEATFEED_SUPABASE_ANON_KEY is not set".into()))?;
        let mut config = Self::new(url, anon_key)?;

        if let Some(bucket) = non_empty("BEATFEED_AUDIO_BUCKET") {
            config.audio_bucket = bucket.trim().to_string();
        }
        if let Some(secs) = non_empty("BEATFEED_REQUEST_TIMEOUT_SECS").and_then(|raw| raw.parse().ok()) {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = non_empty("BEATFEED_RECONNECT_DELAY_MS").and_then(|raw| raw.parse().ok()) {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = non_empty("BEATFEED_HEARTBEAT_SECS").and_then(|raw| raw.parse::<u64>().ok()) {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        config.reset_redirect_url = non_empty("BEATFEED_RESET_REDIRECT_URL");
        Ok(config)
    }

    pub fn graphql_url(&self) -> String {
        format!("{}/graphql/v1", self.supabase_url)
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.supabase_url)
    }

    pub fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.supabase_url, path.trim_start_matches('/'))
    }

    pub fn storage_object_url(&self, object_path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.supabase_url, self.audio_bucket, object_path
        )
    }

    pub fn public_object_url(&self, object_path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.supabase_url, self.audio_bucket, object_path
        )
    }

    /// Websocket endpoint of the realtime service (`ws`/`wss` mirrors `http`/`https`).
    pub fn realtime_url(&self) -> FeedResult<Url> {
        let mut url = Url::parse(&self.supabase_url)
            .map_err(|err| FeedError::Config(format!("invalid base URL: {err}")))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| FeedError::Config("cannot derive websocket URL".into()))?;
        url.set_path("realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

fn sanitize_base_url(mut base: String) -> FeedResult<String> {
    base = base.trim().to_string();
    if !base.starts_with("http://") && !base.starts_with("https://") {
        base = format!("https://{base}");
    }
    while base.ends_with('/') {
        base.pop();
    }
    Url::parse(&base).map_err(|err| FeedError::Config(format!("invalid base URL: {err}")))?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn base_url_gets_scheme_and_loses_trailing_slash() {
        let config = FeedConfig::new("demo.supabase.co//", "anon").unwrap();
        assert_eq!(config.supabase_url, "https://demo.supabase.co");
        assert_eq!(config.graphql_url(), "https://demo.supabase.co/graphql/v1");
        assert_eq!(config.rest_url("posts"), "https://demo.supabase.co/rest/v1/posts");
    }

    #[test]
    fn realtime_url_follows_http_scheme() {
        let secure = FeedConfig::new("https://demo.supabase.co", "key").unwrap();
        let url = secure.realtime_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/realtime/v1/websocket");
        assert_eq!(url.query(), Some("apikey=key&vsn=1.0.0"));

        let local = FeedConfig::new("http://127.0.0.1:54321", "key").unwrap();
        assert_eq!(local.realtime_url().unwrap().scheme(), "ws");
    }

    #[test]
    fn env_lookup_requires_url_and_key() {
        let err = FeedConfig::from_lookup(lookup(&[("BEATFEED_SUPABASE_URL", "http://x")]))
            .unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[test]
    fn env_lookup_applies_overrides() {
        let config = FeedConfig::from_lookup(lookup(&[
            ("BEATFEED_SUPABASE_URL", "http://localhost:54321/"),
            ("BEATFEED_SUPABASE_ANON_KEY", "anon"),
            ("BEATFEED_AUDIO_BUCKET", "stems"),
            ("BEATFEED_RECONNECT_DELAY_MS", "250"),
            ("BEATFEED_HEARTBEAT_SECS", "0"),
            ("BEATFEED_REQUEST_TIMEOUT_SECS", "not-a-number"),
        ]))
        .unwrap();
        assert_eq!(config.audio_bucket, "stems");
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(
            config.public_object_url("u1/a.mp3"),
            "http://localhost:54321/storage/v1/object/public/stems/u1/a.mp3"
        );
    }
}
