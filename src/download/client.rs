//! HTTP transport for downloads: metadata probes and chunk streams.
//!
//! This module provides the [`HttpClient`] wrapper around a pooled reqwest
//! client. Every request goes through the shared per-host rate limiter and a
//! bounded retry loop, so callers above this layer never see transient
//! failures the policy can absorb.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, COOKIE, RANGE, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Method};
use tracing::{debug, instrument, warn};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::user_agent;

/// Browser User-Agent used as fallback when servers return 403.
///
/// The client sends a default User-Agent identifying the tool on the first
/// attempt. If the server responds with 403 (e.g. bot-detection), the retry
/// loop tries once more with this browser-like User-Agent before giving up.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// HTTP client for downloads with streaming support.
///
/// Created once by the engine and reused for every transfer, taking
/// advantage of connection pooling. The rate limiter and retry policy are
/// injected so all consumers share one pacing state.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
}

/// What a metadata probe learned about a remote file.
#[derive(Debug, Clone)]
pub struct RemoteMetadata {
    /// Payload size in bytes; 0 when the server did not say.
    pub size: u64,
    /// Whether the server advertises byte-range requests.
    pub supports_range: bool,
    /// Content-Type header value, when present.
    pub content_type: Option<String>,
}

/// Outcome of pulling the next chunk from a [`BodyStream`].
///
/// Closed by construction: a pull either yields bytes, ends the stream, or
/// fails. There is no ambiguous state for the transfer loop to interpret.
#[derive(Debug)]
pub enum ChunkPull {
    /// The next chunk of the payload.
    Chunk(Bytes),
    /// The stream ended normally.
    Exhausted,
    /// The stream failed; the transfer decides whether to retry the whole
    /// request.
    Failed(DownloadError),
}

/// An open response body being consumed chunk by chunk.
pub struct BodyStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    url: String,
    resumed: bool,
    content_length: Option<u64>,
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream")
            .field("url", &self.url)
            .field("resumed", &self.resumed)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl BodyStream {
    /// Whether the server honored the requested byte range (206).
    #[must_use]
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Total payload size implied by the response, when the server sent one.
    ///
    /// For a ranged response this is the resume offset plus the remaining
    /// bytes, so it always describes the whole file.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Pulls the next chunk from the body.
    pub async fn pull(&mut self) -> ChunkPull {
        match self.inner.next().await {
            Some(Ok(chunk)) => ChunkPull::Chunk(chunk),
            Some(Err(e)) if e.is_timeout() => ChunkPull::Failed(DownloadError::timeout(&self.url)),
            Some(Err(e)) => ChunkPull::Failed(DownloadError::network(&self.url, e)),
            None => ChunkPull::Exhausted,
        }
    }
}

impl HttpClient {
    /// Creates a client with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::Config` if the underlying HTTP client cannot
    /// be constructed (e.g. TLS backend initialization failure).
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, DownloadError> {
        Self::with_timeouts(
            rate_limiter,
            retry_policy,
            CONNECT_TIMEOUT_SECS,
            READ_TIMEOUT_SECS,
        )
    }

    /// Creates a client with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::Config` if the underlying HTTP client cannot
    /// be constructed.
    pub fn with_timeouts(
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, DownloadError> {
        // The read timeout bounds idle time between bytes, not the whole
        // request; a total deadline would kill long transfers mid-stream.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .cookie_store(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(|e| DownloadError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            rate_limiter,
            retry_policy,
        })
    }

    /// The shared rate limiter this client paces requests through.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Probes a remote file with a HEAD request.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` when the request fails after retries or the
    /// server answers with an error status.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn fetch_metadata(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RemoteMetadata, DownloadError> {
        let response = self
            .send_with_retry(Method::HEAD, url, headers, &HashMap::new(), 0)
            .await?;

        // Read the header directly: `content_length()` reports the body size
        // hint, which for a HEAD response is the empty body, not the payload.
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let supports_range = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(size, supports_range, "probed remote metadata");
        Ok(RemoteMetadata {
            size,
            supports_range,
            content_type,
        })
    }

    /// Opens the response body of a file as a chunk stream.
    ///
    /// When `range_start > 0` a `Range: bytes=N-` header is sent; the caller
    /// must check [`BodyStream::resumed`] to learn whether the server honored
    /// it, since origins are free to answer 200 with the full body.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` when the request fails after retries or the
    /// server answers with an error status.
    #[instrument(skip(self, headers, cookies), fields(url = %url, range_start))]
    pub async fn open_stream(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        cookies: &HashMap<String, String>,
        range_start: u64,
    ) -> Result<BodyStream, DownloadError> {
        let response = self
            .send_with_retry(Method::GET, url, headers, cookies, range_start)
            .await?;

        let resumed = range_start > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let content_length = response.content_length().map(|remaining| {
            if resumed {
                range_start.saturating_add(remaining)
            } else {
                remaining
            }
        });

        debug!(resumed, ?content_length, "opened body stream");
        Ok(BodyStream {
            inner: response.bytes_stream().boxed(),
            url: url.to_string(),
            resumed,
            content_length,
        })
    }

    /// Sends a request and returns the raw response. Used by resolvers to
    /// fetch listing pages through the same pacing and retry path as
    /// payload requests.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` when the request fails after retries or the
    /// server answers with an error status.
    #[instrument(skip(self, headers), fields(method = %method, url = %url))]
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<reqwest::Response, DownloadError> {
        self.send_with_retry(method, url, headers, &HashMap::new(), 0)
            .await
    }

    /// Request loop shared by every entry point: rate limit, send, classify,
    /// back off, repeat within the policy's budget.
    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        cookies: &HashMap<String, String>,
        range_start: u64,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut attempt: u32 = 1;
        let mut browser_ua = false;

        loop {
            self.rate_limiter.acquire(url).await;

            let result = self
                .send_once(
                    method.clone(),
                    url,
                    headers,
                    cookies,
                    range_start,
                    browser_ua,
                )
                .await;

            let error = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            // Bot-detection 403s often pass with a browser User-Agent; try
            // that once before treating the status as permanent.
            if let DownloadError::HttpStatus { status: 403, .. } = &error
                && !browser_ua
            {
                debug!(url, "403 with default User-Agent, retrying as browser");
                browser_ua = true;
                continue;
            }

            let retry_after = retry_after_delay(&error);
            let failure = classify_error(&error);

            if failure == FailureType::RateLimited
                && let Some(delay) = retry_after
            {
                // Spread the server's deadline across everything hitting
                // this host, not just the failed request.
                self.rate_limiter.record_rate_limit(url, delay);
            }

            match self.retry_policy.should_retry(failure, attempt) {
                RetryDecision::Retry { delay, .. } => {
                    // A server-mandated delay takes precedence over backoff
                    let wait = retry_after.unwrap_or(delay);
                    warn!(
                        url,
                        attempt,
                        wait_ms = wait.as_millis(),
                        error = %error,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, attempt, reason, "request failed, not retrying");
                    return Err(error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        cookies: &HashMap<String, String>,
        range_start: u64,
        browser_ua: bool,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.request(method, url);

        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !cookies.is_empty() {
            let cookie_header = cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header(COOKIE, cookie_header);
        }
        if range_start > 0 {
            request = request.header(RANGE, format!("bytes={range_start}-"));
        }
        if browser_ua {
            request = request.header(USER_AGENT, BROWSER_USER_AGENT);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Server-mandated delay carried by a 429 error, when parseable.
fn retry_after_delay(error: &DownloadError) -> Option<Duration> {
    match error {
        DownloadError::HttpStatus {
            status: 429,
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}
