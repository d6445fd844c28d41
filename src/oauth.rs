//! Credential refresher.
//!
//! Turns an account's composite refresh token into a short-lived access
//! token via the Google token endpoint, caching the result for five minutes
//! in memory and in the store. Manual accounts short-circuit to their API
//! key. Permanent refresh failures (revoked or invalid grants) are surfaced
//! distinctly so the pool can invalidate the account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::pool::account::{Account, AccountSource};
use crate::store::{prefix, Store};

/// Google OAuth token endpoint.
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Public installed-app OAuth client used by the Cloud Code tooling.
const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";

/// Access tokens are cached this long; upstream tokens live ~1 hour.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Body substrings that mean the refresh token is dead.
const PERMANENT_MARKERS: &[&str] = &[
    "token refresh failed",
    "invalid_grant",
    "token has been expired or revoked",
];

/// Errors from token acquisition.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token is revoked or invalid; the account must be
    /// re-onboarded.
    #[error("permanent auth failure: {0}")]
    Permanent(String),

    /// Transient failure; the request may retry on another attempt.
    #[error("token refresh failed: {0}")]
    Transient(String),

    /// The account has no usable credentials.
    #[error("account {0} has no credentials")]
    NoCredentials(String),
}

impl RefreshError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// OAuth refresh-token → access-token exchange with two-level caching.
pub struct TokenRefresher {
    http: reqwest::Client,
    store: Arc<Store>,
    memory: RwLock<HashMap<String, CachedToken>>,
    token_url: String,
}

impl TokenRefresher {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            memory: RwLock::new(HashMap::new()),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }

    /// Point at a different token endpoint (tests, proxies).
    pub fn with_token_url(store: Arc<Store>, token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            ..Self::new(store)
        }
    }

    /// Obtain an access token for the account.
    pub async fn access_token(&self, account: &Account) -> Result<String, RefreshError> {
        if account.source == AccountSource::Manual || !account.api_key.is_empty() {
            if account.api_key.is_empty() {
                return Err(RefreshError::NoCredentials(account.email.clone()));
            }
            return Ok(account.api_key.clone());
        }

        let (base_refresh, _, _) = account.refresh_parts();
        if base_refresh.is_empty() {
            return Err(RefreshError::NoCredentials(account.email.clone()));
        }

        // 1. In-memory cache.
        {
            let memory = self.memory.read().await;
            if let Some(cached) = memory.get(&account.email) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        // 2. Store cache (its TTL mirrors ours).
        let store_key = format!("{}{}", prefix::TOKCACHE, account.email);
        if let Some(token) = self.store.get_raw(&store_key).await {
            self.remember(&account.email, &token).await;
            return Ok(token);
        }

        // 3. Refresh against the token endpoint.
        debug!(email = %account.email, "Refreshing access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
                ("refresh_token", base_refresh.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(parsed) => parsed
                    .error_description
                    .unwrap_or(parsed.error),
                Err(_) => body.clone(),
            };
            if is_permanent_failure(&detail) || is_permanent_failure(&body) {
                warn!(email = %account.email, %detail, "Refresh token is dead");
                return Err(RefreshError::Permanent(detail));
            }
            return Err(RefreshError::Transient(format!(
                "token endpoint returned {status}: {detail}"
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| RefreshError::Transient(format!("malformed token response: {e}")))?;

        self.remember(&account.email, &parsed.access_token).await;
        let ttl = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(TOKEN_CACHE_TTL)
            .min(TOKEN_CACHE_TTL);
        self.store
            .put_raw(&store_key, parsed.access_token.clone(), Some(ttl))
            .await;

        Ok(parsed.access_token)
    }

    async fn remember(&self, email: &str, token: &str) {
        let mut memory = self.memory.write().await;
        memory.insert(
            email.to_string(),
            CachedToken {
                token: token.to_string(),
                expires_at: Instant::now() + TOKEN_CACHE_TTL,
            },
        );
    }

    /// Drop the cached token for one account.
    pub async fn clear_token_cache(&self, email: &str) {
        self.memory.write().await.remove(email);
        self.store
            .delete(&format!("{}{email}", prefix::TOKCACHE))
            .await;
    }

    /// Drop every cached token and project id.
    pub async fn clear_all_caches(&self) {
        self.memory.write().await.clear();
        self.store.delete_prefix(prefix::TOKCACHE).await;
        self.store.delete_prefix(prefix::PROJCACHE).await;
    }
}

fn is_permanent_failure(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    PERMANENT_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store() -> Arc<Store> {
        Arc::new(Store::in_memory())
    }

    #[tokio::test]
    async fn test_manual_account_returns_api_key() {
        let refresher = TokenRefresher::new(store());
        let account = Account::manual("m@example.com", "sk-key");
        assert_eq!(refresher.access_token(&account).await.unwrap(), "sk-key");
    }

    #[tokio::test]
    async fn test_no_credentials() {
        let refresher = TokenRefresher::new(store());
        let account = Account::oauth("x@example.com", "");
        assert!(matches!(
            refresher.access_token(&account).await,
            Err(RefreshError::NoCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_and_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=base-tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.fresh",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let refresher =
            TokenRefresher::with_token_url(store(), format!("{}/token", server.uri()));
        let account = Account::oauth("a@example.com", "base-tok|proj-1");

        let first = refresher.access_token(&account).await.unwrap();
        assert_eq!(first, "ya29.fresh");

        // Second call is served from cache (mock expects exactly one hit).
        let second = refresher.access_token(&account).await.unwrap();
        assert_eq!(second, "ya29.fresh");
    }

    #[tokio::test]
    async fn test_invalid_grant_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let refresher =
            TokenRefresher::with_token_url(store(), format!("{}/token", server.uri()));
        let account = Account::oauth("a@example.com", "dead-tok");

        let err = refresher.access_token(&account).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let refresher =
            TokenRefresher::with_token_url(store(), format!("{}/token", server.uri()));
        let account = Account::oauth("a@example.com", "tok");

        let err = refresher.access_token(&account).await.unwrap_err();
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_clear_token_cache_forces_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.fresh",
                "expires_in": 3599
            })))
            .expect(2)
            .mount(&server)
            .await;

        let refresher =
            TokenRefresher::with_token_url(store(), format!("{}/token", server.uri()));
        let account = Account::oauth("a@example.com", "tok");

        let _ = refresher.access_token(&account).await.unwrap();
        refresher.clear_token_cache("a@example.com").await;
        let _ = refresher.access_token(&account).await.unwrap();
    }
}
