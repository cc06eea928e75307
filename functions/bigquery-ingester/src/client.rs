use anyhow::{Context, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::auth::{MetadataServerToken, StaticToken, TokenProvider};
use crate::config::Settings;

/// Non-success response from a Google REST API.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{method} {url} returned {status}: {body}")]
pub struct ApiError {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// Returns true when `err` wraps an [`ApiError`] with status 404.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_not_found)
}

/// Authenticated JSON client shared by the Datastore, Cloud Tasks and BigQuery adapters.
#[derive(Clone)]
pub struct GoogleApiClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GoogleApiClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { http, tokens }
    }

    /// Static token when one is configured, metadata server otherwise.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = Self::http_client()?;
        let tokens: Arc<dyn TokenProvider> = match &settings.static_token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(MetadataServerToken::new(http.clone())),
        };
        Ok(Self::new(http, tokens))
    }

    pub fn http_client() -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.execute::<()>(Method::GET, url, None).await?;
        Ok(response.json().await?)
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self.execute(Method::POST, url, Some(body)).await?;
        Ok(response.json().await?)
    }

    pub async fn delete(&self, url: &str) -> Result<()> {
        self.execute::<()>(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn execute<B>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response>
    where
        B: Serialize + ?Sized + Sync,
    {
        let token = self
            .tokens
            .access_token()
            .await
            .context("Failed to acquire access token")?;

        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(%method, url, "Calling Google API");
        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ApiError {
            method: method.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
            body,
        }
        .into())
    }
}
