//! Constants for the download module (timeouts, rate limiting, retry).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default per-chunk pull timeout (30 seconds).
pub const CHUNK_TIMEOUT_SECS: u64 = 30;

/// Default number of in-place retries for a timed-out chunk pull.
pub const CHUNK_RETRIES: u32 = 3;

/// Default number of whole-transfer attempts for recoverable failures.
pub const MAX_RETRIES: u32 = 3;

/// Default requests-per-second granted per host by the rate limiter.
pub const REQUESTS_PER_SECOND: f64 = 2.0;

/// Default minimum interval between progress notifications (500 ms).
pub const PROGRESS_INTERVAL_MS: u64 = 500;

/// Smoothing weight for the exponential moving average of transfer speed.
pub const SPEED_EMA_WEIGHT: f64 = 0.3;

/// Suffix appended to in-flight output files.
pub const PART_SUFFIX: &str = ".part";

/// Warning threshold for cumulative rate limit delay per host (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
