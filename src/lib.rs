//! Resilient HTTP(S) download engine.
//!
//! This library fetches large binary payloads reliably: it resumes
//! interrupted transfers, verifies integrity, decrypts streaming ciphers on
//! the fly, and limits throughput and concurrency while surviving transient
//! network and disk failures without corrupting output.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - transport, single-file transfer state machine, and the
//!   orchestrating [`DownloadManager`]
//! - [`resolver`] - pluggable URL resolution (page URL to file/folder info)
//!
//! # Example
//!
//! ```no_run
//! use binfetch::{DownloadManager, EngineConfig, FileInfo};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(EngineConfig::default())?;
//! let info = FileInfo::new("https://example.com/archive.zip", "archive.zip");
//! let result = manager.download(info).await;
//! println!("success: {}", result.success);
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
pub mod resolver;
mod user_agent;

// Re-export commonly used types
pub use download::{
    ChecksumAlgorithm, ChunkPull, DownloadError, DownloadManager, DownloadResult, DownloadStatus,
    DownloadTask, EngineConfig, FailureType, FileInfo, FolderInfo, HttpClient, Progress,
    ProgressCallback, ProgressUpdate, RateLimiter, RetryDecision, RetryPolicy, classify_error,
};
pub use resolver::{DirectResolver, Resolved, Resolver};
