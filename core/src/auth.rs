/// Access tokens for the per-session auth handshake
use crate::error::{ChatError, Result};
use crate::http::JsonClient;
use crate::protocol::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Lifetime assumed for tokens issued without an explicit expiry
const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 24;

/// A short-lived credential for one session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(default, alias = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }
}

/// Token issuance service consumed by the connection layer
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a credential for `session`, issuing a new one if needed
    async fn access_token(&self, session: &SessionId) -> Result<AccessToken>;

    /// Drop any cached credential for `session` (called after an auth rejection)
    fn invalidate(&self, session: &SessionId);
}

/// Hands out the same token for every session
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self, _session: &SessionId) -> Result<AccessToken> {
        Ok(AccessToken::new(self.token.clone()))
    }

    fn invalidate(&self, _session: &SessionId) {}
}

/// Fetches tokens from `GET {api}/api/sessions/token?session_id=..` and caches
/// them until they expire or are invalidated
pub struct HttpTokenProvider {
    client: JsonClient,
    api_url: String,
    user_token: Option<String>,
    cache: Mutex<HashMap<SessionId, AccessToken>>,
}

impl HttpTokenProvider {
    pub fn new(api_url: impl Into<String>, user_token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: JsonClient::new(timeout),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            user_token,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, session: &SessionId) -> Option<AccessToken> {
        let cache = self.cache.lock().ok()?;
        cache.get(session).filter(|t| !t.is_expired()).cloned()
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn access_token(&self, session: &SessionId) -> Result<AccessToken> {
        if let Some(token) = self.cached(session) {
            debug!("Using cached token for session {}", session);
            return Ok(token);
        }

        let url = format!(
            "{}/api/sessions/token?session_id={}",
            self.api_url,
            urlencoding::encode(session.as_str())
        );
        let mut token: AccessToken = self
            .client
            .get_json(&url, self.user_token.as_deref())
            .await
            .map_err(|e| match e {
                ChatError::AuthRejected(reason) => ChatError::AuthRejected(reason),
                e if e.is_retryable() => e,
                ChatError::RateLimited => {
                    ChatError::Transport("token issuer is rate limiting".to_string())
                }
                other => ChatError::Token(format!("token issuance failed: {}", other)),
            })?;
        if token.token.is_empty() {
            return Err(ChatError::Token("issuer returned an empty token".to_string()));
        }
        if token.expires_at.is_none() {
            token.expires_at = Some(Utc::now() + ChronoDuration::hours(DEFAULT_TOKEN_LIFETIME_HOURS));
        }

        info!("Issued access token for session {}", session);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(session.clone(), token.clone());
        }
        Ok(token)
    }

    fn invalidate(&self, session: &SessionId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(session);
        }
    }
}
