// =============================================================================
// Alor OAuth — refresh-token to JWT exchange
// =============================================================================
//
// Every WebSocket (re)subscribe and unsubscribe carries a short-lived JWT
// obtained from the long-lived refresh token. The JWT is cached and reused
// until its TTL elapses; concurrent callers are serialized behind a tokio
// Mutex so the oauth server sees at most one refresh at a time.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// How long a cached JWT is trusted before a new one is requested.
const TOKEN_TTL: Duration = Duration::from_secs(60);

const OAUTH_URL: &str = "https://oauth.alor.ru";

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(rename = "AccessToken")]
    access_token: String,
}

struct CachedToken {
    access: String,
    issued: Instant,
}

/// Exchanges the Alor refresh token for cached short-lived JWTs.
pub struct TokenProvider {
    client: reqwest::Client,
    oauth_url: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self::with_oauth_url(refresh_token, OAUTH_URL)
    }

    pub fn with_oauth_url(refresh_token: impl Into<String>, oauth_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            oauth_url: oauth_url.into(),
            refresh_token: refresh_token.into(),
            cached: Mutex::new(None),
        }
    }

    /// Return a valid JWT, refreshing it when the cached one expired.
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.issued.elapsed() < TOKEN_TTL {
                return Ok(token.access.clone());
            }
        }

        let url = format!("{}/refresh", self.oauth_url);
        let resp = self
            .client
            .post(&url)
            .query(&[("token", self.refresh_token.as_str())])
            .send()
            .await
            .context("JWT refresh request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("JWT refresh returned {status}");
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .context("failed to parse JWT refresh response")?;

        debug!("JWT refreshed");

        *cached = Some(CachedToken {
            access: body.access_token.clone(),
            issued: Instant::now(),
        });

        Ok(body.access_token)
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("refresh_token", &"<redacted>")
            .field("oauth_url", &self.oauth_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_response_parses_access_token() {
        let json = r#"{"AccessToken": "eyJhbGciOi.payload.sig"}"#;
        let resp: RefreshResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.access_token, "eyJhbGciOi.payload.sig");
    }

    #[test]
    fn debug_redacts_refresh_token() {
        let provider = TokenProvider::new("super-secret");
        let debug = format!("{provider:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
