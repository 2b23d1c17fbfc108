//! Resilient HTTP download engine for streaming files to disk.
//!
//! This module provides concurrent, resumable downloads with per-host rate
//! limiting, integrity verification, and streaming decryption.
//!
//! # Features
//!
//! - Streaming downloads (memory-efficient for large files)
//! - Resume of interrupted transfers via HTTP range requests
//! - Per-host token-bucket rate limiting with Retry-After support
//! - MD5/SHA-256 verification and AES-CTR decryption in flight
//! - Pause, resume, and cancel controls per task
//! - Structured error types with full context
//!
//! # Example
//!
//! ```no_run
//! use binfetch::download::{DownloadManager, EngineConfig, FileInfo};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(EngineConfig::default())?;
//! let info = FileInfo::new("https://example.com/archive.zip", "archive.zip");
//! let result = manager.download(info).await;
//! println!("success: {}", result.success);
//! # Ok(())
//! # }
//! ```

mod checksum;
mod client;
mod constants;
mod crypto;
mod engine;
mod error;
pub(crate) mod filename;
pub mod rate_limiter;
mod retry;
mod task;
mod transfer;

pub use checksum::{ChecksumAlgorithm, ChecksumHasher, digests_match};
pub use client::{BROWSER_USER_AGENT, BodyStream, ChunkPull, HttpClient, RemoteMetadata};
pub use engine::{DownloadManager, EngineConfig};
pub use error::DownloadError;
pub use rate_limiter::{RateLimiter, extract_host, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use task::{
    DownloadResult, DownloadStatus, DownloadTask, FileInfo, FolderInfo, Progress,
    ProgressCallback, ProgressUpdate,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
