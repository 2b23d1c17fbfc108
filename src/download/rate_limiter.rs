//! Per-host token-bucket rate limiting for download requests.
//!
//! This module provides the [`RateLimiter`] struct which caps the rate of
//! requests to each destination host, preventing servers from blocking the
//! client due to excessive request rates.
//!
//! # Overview
//!
//! Rate limiting is applied per-host, meaning requests to different hosts
//! can proceed in parallel without waiting for each other. Each host owns a
//! token bucket refilled at the configured rate; a request consumes one
//! token, sleeping when the bucket is empty. A server-sent Retry-After is
//! recorded as a host-wide not-before deadline that all subsequent requests
//! respect.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use binfetch::download::RateLimiter;
//!
//! # async fn example() {
//! // Allow two requests per second per host
//! let limiter = Arc::new(RateLimiter::new(2.0));
//!
//! // First request proceeds immediately
//! limiter.acquire("https://example.com/file1.bin").await;
//!
//! // Later requests to the same host are paced; other hosts are unaffected
//! limiter.acquire("https://other.com/file.bin").await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Maximum tokens a bucket can hold (burst size).
const BUCKET_CAPACITY: f64 = 1.0;

/// Per-host token-bucket rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across the transport and every
/// transfer; the orchestrator constructs one limiter and injects it wherever
/// requests are issued. Uses `DashMap` for lock-free access to per-host state
/// and `tokio::sync::Mutex` for atomic read-update operations on bucket
/// timing.
#[derive(Debug)]
pub struct RateLimiter {
    /// Default requests-per-second granted per host.
    default_rate: f64,

    /// Per-host rate overrides (host, requests per second).
    overrides: HashMap<String, f64>,

    /// Whether rate limiting is disabled (rate of 0 means unlimited).
    disabled: bool,

    /// Per-host bucket state.
    /// Uses Arc to allow cloning the state and releasing the `DashMap` shard
    /// lock before awaiting on the inner Mutex.
    hosts: DashMap<String, Arc<HostBucket>>,
}

/// Token bucket tracked for each host.
#[derive(Debug)]
struct HostBucket {
    /// Bucket timing state, protected for atomic read-update.
    state: Mutex<BucketState>,

    /// Cumulative delay applied to this host (in milliseconds).
    /// Used to warn when excessive rate limiting occurs.
    cumulative_delay_ms: AtomicU64,
}

#[derive(Debug)]
struct BucketState {
    /// Tokens currently available (fractional; refilled continuously).
    tokens: f64,

    /// When tokens were last refilled.
    last_refill: Instant,

    /// Host-wide deadline from a server Retry-After; no request may be
    /// issued before it.
    not_before: Option<Instant>,
}

impl HostBucket {
    /// Creates a full bucket so the first request proceeds immediately.
    fn new() -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: BUCKET_CAPACITY,
                last_refill: Instant::now(),
                not_before: None,
            }),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Adds to the cumulative delay and returns the new total.
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a new rate limiter granting `requests_per_second` to each host.
    ///
    /// A rate of `0.0` (or any non-positive value) disables limiting.
    #[must_use]
    #[instrument(skip_all, fields(rate = requests_per_second))]
    pub fn new(requests_per_second: f64) -> Self {
        debug!("creating rate limiter");
        Self {
            default_rate: requests_per_second,
            overrides: HashMap::new(),
            disabled: requests_per_second <= 0.0,
            hosts: DashMap::new(),
        }
    }

    /// Creates a rate limiter with per-host rate overrides.
    ///
    /// Hosts absent from `overrides` fall back to the default rate.
    #[must_use]
    pub fn with_overrides(requests_per_second: f64, overrides: HashMap<String, f64>) -> Self {
        Self {
            default_rate: requests_per_second,
            overrides,
            disabled: requests_per_second <= 0.0,
            hosts: DashMap::new(),
        }
    }

    /// Creates a disabled rate limiter that applies no delays.
    #[must_use]
    #[instrument]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            default_rate: 0.0,
            overrides: HashMap::new(),
            disabled: true,
            hosts: DashMap::new(),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the default requests-per-second rate.
    #[must_use]
    pub fn default_rate(&self) -> f64 {
        self.default_rate
    }

    /// Effective rate for a host, honoring overrides.
    fn rate_for(&self, host: &str) -> f64 {
        self.overrides.get(host).copied().unwrap_or(self.default_rate)
    }

    /// Acquires permission to make a request to the given URL's host.
    ///
    /// Consumes one token from the host's bucket, sleeping until one is
    /// available. Any recorded Retry-After deadline for the host is honored
    /// first. The first request to a host proceeds immediately.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        if self.disabled {
            return;
        }

        let host = extract_host(url);
        tracing::Span::current().record("host", &host);

        let rate = self.rate_for(&host);
        if rate <= 0.0 {
            return;
        }

        // Get or create bucket state, clone Arc to release the DashMap shard
        // lock before awaiting on the Mutex.
        let bucket = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostBucket::new()))
            .clone();

        // Holding the Mutex across the sleeps serializes waiters on the same
        // host, which is exactly the pacing the bucket is meant to enforce.
        let mut state = bucket.state.lock().await;

        if let Some(deadline) = state.not_before {
            let now = Instant::now();
            if deadline > now {
                let wait = deadline - now;
                let cumulative = bucket.add_cumulative_delay(wait);
                debug!(
                    host = %host,
                    wait_ms = wait.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "waiting for server-mandated deadline"
                );
                tokio::time::sleep_until(deadline).await;
            }
            state.not_before = None;
        }

        // Refill tokens for the elapsed interval, capped at the burst size
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * rate).min(BUCKET_CAPACITY);
        state.last_refill = now;

        if state.tokens < 1.0 {
            let deficit = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / rate);
            let cumulative = bucket.add_cumulative_delay(wait);

            debug!(
                host = %host,
                wait_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "token bucket empty, pacing request"
            );

            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    host = %host,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume to this host"
                );
            }

            tokio::time::sleep(wait).await;
            state.tokens = 1.0;
            state.last_refill = Instant::now();
        }

        state.tokens -= 1.0;
    }

    /// Records a server-mandated delay (from a 429 Retry-After header).
    ///
    /// Sets a host-wide not-before deadline so every subsequent request to
    /// the host waits it out, and empties the bucket.
    #[instrument(skip(self), fields(host))]
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        tracing::Span::current().record("host", &host);

        let bucket = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostBucket::new()))
            .clone();

        let deadline = Instant::now() + delay;
        if let Ok(mut state) = bucket.state.try_lock() {
            state.tokens = 0.0;
            state.not_before = Some(match state.not_before {
                Some(existing) if existing > deadline => existing,
                _ => deadline,
            });
        }
        // If the bucket is locked, a waiter is already sleeping for this
        // host; its own pacing covers the interval.

        let cumulative = bucket.add_cumulative_delay(delay);
        debug!(
            host = %host,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );

        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                host = %host,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - site may be under heavy load"
            );
        }
    }
}

/// Extracts the host from a URL.
///
/// Returns "unknown" for malformed URLs, ensuring all requests are still
/// rate limited even if the URL cannot be parsed.
///
/// # Examples
///
/// ```
/// use binfetch::download::rate_limiter::extract_host;
///
/// assert_eq!(extract_host("https://example.com/path"), "example.com");
/// assert_eq!(extract_host("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_host("https://192.168.1.1/file"), "192.168.1.1");
/// assert_eq!(extract_host("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use binfetch::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    // Try parsing as integer seconds first (most common)
    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    // Try parsing as HTTP-date
    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();

        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            debug!(
                header_value,
                "Retry-After date is in the past, returning zero"
            );
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
