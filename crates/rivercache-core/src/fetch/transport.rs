//! Upstream fetchers.
//!
//! A [`Fetcher`] turns a cache key into raw bytes plus an HTTP status. The
//! fallback chain owns retry and fallback policy; fetchers only move bytes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::TransportError;

/// Upper bound applied by the shared HTTP client.
/// Individual sources use shorter per-request timeouts.
const CLIENT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &str, timeout: Duration) -> Result<RawResponse, TransportError>;
}

/// HTTP GET against a key-templated URL.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    url_template: String,
}

impl HttpFetcher {
    pub fn new(url_template: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self::with_client(default_client()?, url_template))
    }

    /// Create a fetcher sharing an existing connection pool.
    pub fn with_client(client: Client, url_template: impl Into<String>) -> Self {
        Self {
            client,
            url_template: url_template.into(),
        }
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }
}

/// Build the shared HTTP client.
pub fn default_client() -> Result<Client, TransportError> {
    Client::builder()
        .timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))
        .build()
        .map_err(|e| TransportError::Network(e.to_string()))
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &str, timeout: Duration) -> Result<RawResponse, TransportError> {
        let url = render_url(&self.url_template, key);
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| request_error(e, timeout))?.to_vec();
        Ok(RawResponse { status, body })
    }
}

/// Timeouts report the budget that ran out, whether headers or body were late.
fn request_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    match TransportError::from(e) {
        TransportError::Timeout(_) => TransportError::Timeout(timeout),
        other => other,
    }
}

/// Substitute a key into a URL template.
///
/// `{key}` is the whole key; `{0}`, `{1}`, ... are its `:`-separated
/// segments. Placeholders for segments the key does not have are left as-is.
pub fn render_url(template: &str, key: &str) -> String {
    let mut url = template.replace("{key}", key);
    for (i, segment) in key.split(':').enumerate() {
        url = url.replace(&format!("{{{}}}", i), segment);
    }
    url
}
