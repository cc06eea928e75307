use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// Refresh this long before the server-reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Source of OAuth2 bearer tokens for Google APIs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, e.g. the output of `gcloud auth print-access-token`.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Default service account token from the instance metadata server.
pub struct MetadataServerToken {
    http: reqwest::Client,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerToken {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_url(http, METADATA_TOKEN_URL)
    }

    pub fn with_url(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("Failed to reach metadata server")?
            .error_for_status()
            .context("Metadata server refused token request")?;

        response
            .json::<TokenResponse>()
            .await
            .context("Malformed token response from metadata server")
    }
}

#[async_trait]
impl TokenProvider for MetadataServerToken {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.fetch().await?;
        debug!(expires_in = fresh.expires_in, "Fetched access token");

        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            token: fresh.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        Ok(fresh.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token() {
        let provider = StaticToken::new("ya29.token");
        let token = tokio_test::block_on(provider.access_token()).unwrap();
        assert_eq!(token, "ya29.token");
    }

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{"access_token":"ya29.abc","expires_in":3599,"token_type":"Bearer"}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "ya29.abc");
        assert_eq!(response.expires_in, 3599);
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        // Unroutable URL: any fetch would fail, so success proves the cache hit.
        let provider =
            MetadataServerToken::with_url(reqwest::Client::new(), "http://127.0.0.1:9/token");
        *provider.cached.lock().await = Some(CachedToken {
            token: "cached".to_string(),
            refresh_at: Instant::now() + Duration::from_secs(300),
        });

        assert_eq!(provider.access_token().await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn test_unreachable_metadata_server_is_an_error() {
        let provider =
            MetadataServerToken::with_url(reqwest::Client::new(), "http://127.0.0.1:9/token");
        let err = provider.access_token().await.unwrap_err();
        assert!(err.to_string().contains("metadata server"));
    }
}
