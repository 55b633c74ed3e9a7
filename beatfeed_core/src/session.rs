use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Mutex};

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| at <= now + ChronoDuration::seconds(EXPIRY_SKEW_SECS))
            .unwrap_or(false)
    }
}

/// Read-only view of the process-wide session. Every network call asks for
/// the token at call time instead of holding a copy.
#[async_trait]
pub trait SessionSource: Send + Sync {
    fn current(&self) -> Option<Session>;

    /// A token valid right now, refreshed first if it is about to expire.
    /// `None` when nobody is signed in.
    async fn access_token(&self) -> FeedResult<Option<String>>;

    /// Fires on sign-in, sign-out and token refresh.
    fn watch(&self) -> watch::Receiver<Option<Session>>;

    fn current_user_id(&self) -> Option<String> {
        self.current().map(|session| session.user_id)
    }
}

pub fn require_user(source: &dyn SessionSource) -> FeedResult<String> {
    source
        .current_user_id()
        .ok_or_else(|| FeedError::Auth("not signed in".into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The platform auto-confirmed the account and opened a session.
    SignedIn(Session),
    /// A confirmation link was emailed; sign in after following it.
    ConfirmationRequired,
}

/// Account lifecycle operations owned by the platform's auth service.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> FeedResult<SignUpOutcome>;
    async fn sign_in(&self, email: &str, password: &str) -> FeedResult<Session>;
    async fn sign_out(&self) -> FeedResult<()>;
    async fn request_password_reset(&self, email: &str) -> FeedResult<()>;
    /// Trades the code from a reset email for a session, so that
    /// `update_password` can follow without a browser.
    async fn verify_recovery(&self, email: &str, code: &str) -> FeedResult<Session>;
    async fn update_password(&self, password: &str, confirm: &str) -> FeedResult<()>;
}

pub fn validate_credentials(email: &str, password: &str) -> FeedResult<()> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(FeedError::validation("enter a valid email address"));
    }
    if password.is_empty() {
        return Err(FeedError::validation("password is required"));
    }
    Ok(())
}

pub fn validate_recovery(email: &str, code: &str) -> FeedResult<()> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(FeedError::validation("enter a valid email address"));
    }
    if code.trim().is_empty() {
        return Err(FeedError::validation("enter the code from the reset email"));
    }
    Ok(())
}

pub fn validate_new_password(password: &str, confirm: &str) -> FeedResult<()> {
    if password.is_empty() || confirm.is_empty() {
        return Err(FeedError::validation(
            "please enter and confirm your new password",
        ));
    }
    if password != confirm {
        return Err(FeedError::validation("passwords do not match"));
    }
    Ok(())
}

/// HTTP client for the platform's auth service (`/auth/v1`).
pub struct AuthClient {
    config: FeedConfig,
    client: Client,
    state: watch::Sender<Option<Session>>,
    refresh_lock: Mutex<()>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc.timestamp_opt(at, 0).single(),
            (None, Some(secs)) => Some(now + ChronoDuration::seconds(secs)),
            (None, None) => None,
        };
        Session {
            user_id: self.user.id,
            email: self.user.email,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

impl AuthClient {
    pub fn new(config: FeedConfig) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| FeedError::Config(format!("failed to build HTTP client: {err}")))?;
        let (state, _) = watch::channel(None);
        Ok(Self {
            config,
            client,
            state,
            refresh_lock: Mutex::new(()),
        })
    }

    fn set_session(&self, session: Option<Session>) {
        self.state.send_replace(session);
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> FeedResult<serde_json::Value> {
        let response = self
            .client
            .post(self.config.auth_url(path))
            .header("apikey", &self.config.anon_key)
            .json(&body)
            .send()
            .await?;
        read_auth_response(response).await
    }

    async fn refresh(&self, refresh_token: &str) -> FeedResult<Session> {
        let value = self
            .post_json(
                "token?grant_type=refresh_token",
                json!({ "refresh_token": refresh_token }),
            )
            .await?;
        let token: TokenResponse = serde_json::from_value(value)?;
        Ok(token.into_session(Utc::now()))
    }
}

async fn read_auth_response(response: reqwest::Response) -> FeedResult<serde_json::Value> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        let message = auth_error_message(&body).unwrap_or(body);
        return Err(match status.as_u16() {
            400 | 401 | 403 | 422 => FeedError::Auth(message),
            _ => FeedError::from_status(status, &message),
        });
    }
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

fn auth_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[async_trait]
impl SessionSource for AuthClient {
    fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    async fn access_token(&self) -> FeedResult<Option<String>> {
        let Some(session) = self.current() else {
            return Ok(None);
        };
        if !session.is_expired_at(Utc::now()) {
            return Ok(Some(session.access_token));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        let Some(session) = self.current() else {
            return Ok(None);
        };
        if !session.is_expired_at(Utc::now()) {
            return Ok(Some(session.access_token));
        }
        let Some(refresh_token) = session.refresh_token.clone() else {
            self.set_session(None);
            return Err(FeedError::Auth("session expired".into()));
        };
        match self.refresh(&refresh_token).await {
            Ok(fresh) => {
                tracing::debug!(user_id = %fresh.user_id, "refreshed access token");
                let token = fresh.access_token.clone();
                self.set_session(Some(fresh));
                Ok(Some(token))
            }
            Err(err @ FeedError::Auth(_)) => {
                tracing::warn!(error = %err, "refresh rejected, signing out");
                self.set_session(None);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }
}

#[async_trait]
impl Authenticator for AuthClient {
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
        let value = self
            .post_json(
                "signup",
                json!({
                    "email": email.trim(),
                    "password": password,
                    "data": { "display_name": display_name.trim() },
                }),
            )
            .await?;
        if value.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(value)?;
            let session = token.into_session(Utc::now());
            tracing::info!(user_id = %session.user_id, "signed up and signed in");
            self.set_session(Some(session.clone()));
            return Ok(SignUpOutcome::SignedIn(session));
        }
        tracing::info!(email = %email.trim(), "sign-up pending email confirmation");
        Ok(SignUpOutcome::ConfirmationRequired)
    }

    async fn sign_in(&self, email: &str, password: &str) -> FeedResult<Session> {
        validate_credentials(email, password)?;
        let value = self
            .post_json(
                "token?grant_type=password",
                json!({ "email": email.trim(), "password": password }),
            )
            .await?;
        let token: TokenResponse = serde_json::from_value(value)?;
        let session = token.into_session(Utc::now());
        tracing::info!(user_id = %session.user_id, "signed in");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> FeedResult<()> {
        let Some(session) = self.current() else {
            return Ok(());
        };
        let result = self
            .client
            .post(self.config.auth_url("logout"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await;
        // The local session ends regardless of what the server says.
        self.set_session(None);
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "logout request rejected");
            }
            Err(err) => tracing::warn!(error = %err, "logout request failed"),
            Ok(_) => {}
        }
        tracing::info!(user_id = %session.user_id, "signed out");
        Ok(())
    }

    async fn request_password_reset(&self, email: &str) -> FeedResult<()> {
        if email.trim().is_empty() {
            return Err(FeedError::validation("enter your email first"));
        }
        let mut request = self
            .client
            .post(self.config.auth_url("recover"))
            .header("apikey", &self.config.anon_key)
            .json(&json!({ "email": email.trim() }));
        if let Some(redirect) = &self.config.reset_redirect_url {
            request = request.query(&[("redirect_to", redirect.as_str())]);
        }
        read_auth_response(request.send().await?).await?;
        tracing::info!(email = %email.trim(), "password reset requested");
        Ok(())
    }

    async fn verify_recovery(&self, email: &str, code: &str) -> FeedResult<Session> {
        validate_recovery(email, code)?;
        let value = self
            .post_json(
                "verify",
                json!({ "type": "recovery", "email": email.trim(), "token": code.trim() }),
            )
            .await?;
        let token: TokenResponse = serde_json::from_value(value)?;
        let session = token.into_session(Utc::now());
        tracing::info!(user_id = %session.user_id, "recovery session opened");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    async fn update_password(&self, password: &str, confirm: &str) -> FeedResult<()> {
        validate_new_password(password, confirm)?;
        let token = self
            .access_token()
            .await?
            .ok_or_else(|| FeedError::Auth("verify the reset code or sign in first".into()))?;
        let response = self
            .client
            .put(self.config.auth_url("user"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token)
            .json(&json!({ "password": password }))
            .send()
            .await?;
        read_auth_response(response).await?;
        tracing::info!("password updated");
        Ok(())
    }
}
