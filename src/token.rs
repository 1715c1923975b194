//! Access tokens for probe requests, acquired per environment.

use crate::error::TokenError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of bearer tokens, scoped by environment.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, environment: &str) -> Result<String, TokenError>;
}

/// Fixed token for tests and local setups.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _environment: &str) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct CachedToken {
    access_token: String,
    fetched_at: Instant,
}

/// Client-credentials OAuth2 provider. Tokens are cached per environment and
/// refetched after `refresh_period`; [`refresh_all`](Self::refresh_all) lets
/// the service renew them ahead of expiry on its own cadence.
pub struct OAuth2TokenProvider {
    client: reqwest::Client,
    token_uri: String,
    client_id: String,
    client_secret: String,
    refresh_period: Duration,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl std::fmt::Debug for OAuth2TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2TokenProvider")
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl OAuth2TokenProvider {
    /// `token_uri` may contain an `{environment}` placeholder.
    pub fn new(
        client: reqwest::Client,
        token_uri: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_period: Duration,
    ) -> Self {
        Self {
            client,
            token_uri: token_uri.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_period,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, environment: &str) -> Result<String, TokenError> {
        let uri = self.token_uri.replace("{environment}", environment);
        let response = self
            .client
            .post(&uri)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TokenError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status(status.as_u16()));
        }
        let body: TokenResponse =
            response.json().await.map_err(|e| TokenError::Decode(e.to_string()))?;

        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            environment.to_string(),
            CachedToken { access_token: body.access_token.clone(), fetched_at: Instant::now() },
        );
        tracing::debug!(environment, "access token refreshed");
        Ok(body.access_token)
    }

    /// Refetch every cached environment. Failures are logged; a stale token
    /// stays in the cache for the next attempt.
    pub async fn refresh_all(&self) {
        let environments: Vec<String> = {
            let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.keys().cloned().collect()
        };
        for environment in environments {
            if let Err(error) = self.fetch(&environment).await {
                tracing::warn!(environment = %environment, %error, "token refresh failed");
            }
        }
    }
}

#[async_trait]
impl TokenProvider for OAuth2TokenProvider {
    async fn token(&self, environment: &str) -> Result<String, TokenError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(cached) = cache.get(environment) {
                if cached.fetched_at.elapsed() < self.refresh_period {
                    return Ok(cached.access_token.clone());
                }
            }
        }
        self.fetch(environment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_ignores_the_environment() {
        let provider = StaticTokenProvider::new("t0ken");
        assert_eq!(provider.token("integration").await.unwrap(), "t0ken");
        assert_eq!(provider.token("prod").await.unwrap(), "t0ken");
    }

    #[test]
    fn token_uri_placeholder_is_per_environment() {
        let provider = OAuth2TokenProvider::new(
            reqwest::Client::new(),
            "https://auth.test/{environment}/token",
            "polaris",
            "secret",
            Duration::from_secs(4 * 60 * 60),
        );
        assert_eq!(
            provider.token_uri.replace("{environment}", "prod"),
            "https://auth.test/prod/token"
        );
    }
}
