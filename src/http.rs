//! HTTP access to the archive.
//!
//! [`ArchiveClient`] wraps a [`Transport`] with the policies every archive
//! request shares:
//!
//! - a per-attempt deadline,
//! - bounded exponential backoff that retries **timeouts only** (HTTP
//!   errors and undecodable bodies fail immediately),
//! - JSON decoding regardless of the advertised content type, since some
//!   metadata files are served as `application/octet-stream`.
//!
//! Directory listings get their own error type, [`ListingError`], because a
//! failed listing means something different to callers than a missing
//! metadata file.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::FetchConfig;
use crate::traits::Transport;

/// GET request envelope handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Raw response: status and undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: String::new(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
    timed_out: bool,
}

impl TransportError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        self.timed_out
    }
}

/// Failure of a single archive fetch, after retries.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout on GET '{url}' after {attempts} attempt(s)")]
    Timeout { url: String, attempts: u32 },
    #[error("GET '{url}' returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("GET '{url}' failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("could not decode '{url}': {reason}")]
    Decode { url: String, reason: String },
}

impl FetchError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// A directory listing could not be obtained.
#[derive(Debug, Error)]
#[error("could not fetch listing '{url}': {source}")]
pub struct ListingError {
    pub url: String,
    #[source]
    pub source: FetchError,
}

impl ListingError {
    pub const fn is_timeout(&self) -> bool {
        self.source.is_timeout()
    }
}

/// Directory listing document: `{"prefixes": [...], "files": [{"name": ...}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Listing {
    pub prefixes: Vec<String>,
    pub files: Vec<ListingFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListingFile {
    pub name: String,
}

// ============ Backoff ============

/// Exponential backoff between attempts.
///
/// The delay before retry `n` (0-based) is `base * factor^n`, capped at
/// `max`, optionally spread by ±50% jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let seconds = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let delay = Duration::from_secs_f64(seconds.min(self.max.as_secs_f64()));
        if !self.jitter {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 2;
        let offset = fastrand::u64(0..=spread * 2);
        Duration::from_millis((delay.as_millis() as u64 + offset).saturating_sub(spread))
    }
}

/// Retry behaviour for archive requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

// ============ Transport implementations ============

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.get(&request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_reqwest_error)?;

        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::timeout(format!("request timeout: {}", e))
    } else if e.is_connect() {
        TransportError::connect(format!("connection failed: {}", e))
    } else {
        TransportError::connect(format!("request failed: {}", e))
    }
}

// ============ Archive client ============

/// Shared, cheaply clonable client for archive requests.
#[derive(Clone)]
pub struct ArchiveClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ArchiveClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            transport,
            timeout,
            retry,
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &FetchConfig) -> Self {
        Self::new(transport, config.timeout(), config.retry_policy())
    }

    /// GET a JSON document.
    pub async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
        let request = HttpRequest::get(url)
            .with_header("Accept", "application/json")
            .with_header("Cache", "no-cache");
        let body = self.fetch_body(&request).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// GET a plain-text document.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.fetch_body(&HttpRequest::get(url)).await
    }

    /// GET a directory listing. Both `prefixes` and `files` must be present.
    pub async fn fetch_listing(&self, url: &str) -> Result<Listing, ListingError> {
        let value = self.fetch_json(url).await.map_err(|source| ListingError {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_value(value).map_err(|e| ListingError {
            url: url.to_string(),
            source: FetchError::Decode {
                url: url.to_string(),
                reason: e.to_string(),
            },
        })
    }

    async fn fetch_body(&self, request: &HttpRequest) -> Result<String, FetchError> {
        let response = self
            .with_retry(&request.url, || self.attempt(request))
            .await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url: request.url.clone(),
                status: response.status,
            });
        }
        Ok(response.body)
    }

    async fn attempt(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        tracing::debug!("GET '{}'", request.url);
        let outcome = tokio::time::timeout(self.timeout, self.transport.get(request, self.timeout))
            .await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(FetchError::Timeout {
                url: request.url.clone(),
                attempts: 1,
            }),
            Ok(Err(e)) => Err(FetchError::Transport {
                url: request.url.clone(),
                source: e,
            }),
            Err(_elapsed) => Err(FetchError::Timeout {
                url: request.url.clone(),
                attempts: 1,
            }),
        }
    }

    /// Run `op` until it succeeds, fails with a non-timeout error, or the
    /// attempt budget is spent.
    async fn with_retry<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(FetchError::Timeout { .. }) if attempt < max_attempts => {
                    let delay = self.retry.backoff.delay(attempt - 1);
                    tracing::warn!(
                        "Timeout on GET '{}' (attempt {}/{}), retrying in {:?}",
                        url,
                        attempt,
                        max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(FetchError::Timeout { .. }) => {
                    tracing::error!("Timeout on GET '{}'", url);
                    return Err(FetchError::Timeout {
                        url: url.to_string(),
                        attempts: attempt,
                    });
                }
                other => return other,
            }
        }
    }
}
