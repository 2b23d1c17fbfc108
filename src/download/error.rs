//! Error types for the download module.
//!
//! This module defines structured errors for all download operations,
//! providing context-rich error messages for debugging and user feedback.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during file downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request or chunk read timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    ///
    /// A 429 carries the Retry-After header value when the server sent one.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Destination volume lacks the space needed to hold the payload.
    #[error(
        "insufficient disk space for {path}: need {required_bytes} bytes, {available_bytes} available"
    )]
    DiskSpace {
        /// Destination path that could not be satisfied.
        path: PathBuf,
        /// Bytes still needed for the transfer.
        required_bytes: u64,
        /// Bytes available on the destination volume.
        available_bytes: u64,
    },

    /// Downloaded file size does not match the expected content length.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// Download path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// Downloaded content digest does not match the declared checksum.
    #[error("checksum mismatch for {path}: expected {expected}, computed {actual}")]
    Checksum {
        /// Download path that failed verification.
        path: PathBuf,
        /// Declared digest (hex).
        expected: String,
        /// Computed digest (hex).
        actual: String,
    },

    /// No collision-free output name could be reserved.
    #[error("could not reserve a unique filename for {filename} in {dir} after {attempts} attempts")]
    NamingConflict {
        /// Destination directory.
        dir: PathBuf,
        /// The contested base filename.
        filename: String,
        /// How many candidate names were tried.
        attempts: usize,
    },

    /// The transfer was cancelled by the caller.
    #[error("download cancelled: {url}")]
    Cancelled {
        /// The URL whose transfer was cancelled.
        url: String,
    },

    /// Invalid task configuration (e.g. encrypted source without key material).
    #[error("invalid download configuration: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a disk space error.
    pub fn disk_space(path: impl Into<PathBuf>, required_bytes: u64, available_bytes: u64) -> Self {
        Self::DiskSpace {
            path: path.into(),
            required_bytes,
            available_bytes,
        }
    }

    /// Creates a size integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Checksum {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a naming conflict error.
    pub fn naming_conflict(
        dir: impl Into<PathBuf>,
        filename: impl Into<String>,
        attempts: usize,
    ) -> Self {
        Self::NamingConflict {
            dir: dir.into(),
            filename: filename.into(),
            attempts,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true when the error terminates the whole download regardless
    /// of retry budget (cancellation and local terminal failures).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. }
                | Self::DiskSpace { .. }
                | Self::Integrity { .. }
                | Self::Checksum { .. }
                | Self::NamingConflict { .. }
                | Self::Config { .. }
        )
    }
}

// Note on From trait implementations:
// We intentionally do NOT implement `From<reqwest::Error>` or `From<std::io::Error>`
// because our error variants require context (url, path) that the source errors
// don't provide. The helper constructor methods (network(), io(), etc.) allow
// callers to provide that context.
