//! Download engine: task creation, concurrency control, and fan-out.
//!
//! This module provides the [`DownloadManager`] which coordinates concurrent
//! downloads using semaphore-based concurrency control, with whole-transfer
//! retry on recoverable failures and per-host request pacing shared across
//! every transfer.
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

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::client::HttpClient;
use super::constants::{
    CHUNK_RETRIES, CHUNK_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS, MAX_RETRIES, PROGRESS_INTERVAL_MS,
    READ_TIMEOUT_SECS, REQUESTS_PER_SECOND,
};
use super::error::DownloadError;
use super::filename::{fallback_filename_from_url, reserve_unique_path, sanitize_filename};
use super::rate_limiter::RateLimiter;
use super::retry::{FailureType, RetryPolicy, classify_error};
use super::task::{
    DownloadResult, DownloadStatus, DownloadTask, FileInfo, ProgressCallback,
};
use super::transfer;
use crate::resolver::{DirectResolver, Resolved, Resolver};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Engine configuration.
///
/// All fields have working defaults; construct with struct update syntax:
///
/// ```
/// use binfetch::EngineConfig;
///
/// let config = EngineConfig {
///     max_concurrent: 8,
///     ..EngineConfig::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory completed downloads land in.
    pub output_dir: PathBuf,

    /// Maximum transfers running at once (1 to 100).
    pub max_concurrent: usize,

    /// Extra cap on parallelism within one folder download; defaults to
    /// `max_concurrent` when unset.
    pub folder_concurrent: Option<usize>,

    /// Seconds to wait for a single chunk before counting a timeout strike.
    pub chunk_timeout_secs: u64,

    /// In-place retries for timed-out chunk pulls before the attempt fails.
    pub chunk_retries: u32,

    /// Whole-transfer attempts for recoverable failures (including the
    /// first).
    pub max_retries: u32,

    /// Whether `.part` files are resumed with HTTP range requests.
    pub enable_resume: bool,

    /// Per-transfer speed ceiling in bytes per second; `None` is unlimited.
    pub speed_limit: Option<u64>,

    /// Requests per second granted to each host; non-positive disables
    /// pacing.
    pub requests_per_second: f64,

    /// Per-host overrides for `requests_per_second`.
    pub host_rate_overrides: HashMap<String, f64>,

    /// Minimum milliseconds between progress callback invocations.
    pub progress_interval_ms: u64,

    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            max_concurrent: 3,
            folder_concurrent: None,
            chunk_timeout_secs: CHUNK_TIMEOUT_SECS,
            chunk_retries: CHUNK_RETRIES,
            max_retries: MAX_RETRIES,
            enable_resume: true,
            speed_limit: None,
            requests_per_second: REQUESTS_PER_SECOND,
            host_rate_overrides: HashMap::new(),
            progress_interval_ms: PROGRESS_INTERVAL_MS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
        }
    }
}

/// Orchestrates downloads: creates tasks, gates concurrency, retries
/// recoverable failures, and fans folder listings out to member transfers.
///
/// Configure (register resolvers, set a progress callback) before sharing;
/// all download methods take `&self`.
pub struct DownloadManager {
    config: EngineConfig,
    client: HttpClient,
    semaphore: Arc<Semaphore>,
    folder_semaphore: Arc<Semaphore>,
    tasks: DashMap<u64, Arc<DownloadTask>>,
    next_id: AtomicU64,
    resolvers: Vec<Arc<dyn Resolver>>,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("config", &self.config)
            .field("tasks", &self.tasks.len())
            .field("resolvers", &self.resolvers.len())
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager from configuration.
    ///
    /// A [`DirectResolver`] is pre-registered so plain file URLs work out of
    /// the box.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::Config` for out-of-range concurrency values
    /// or when the HTTP client cannot be built.
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        let rate_limiter = Arc::new(RateLimiter::with_overrides(
            config.requests_per_second,
            config.host_rate_overrides.clone(),
        ));
        Self::with_rate_limiter(config, rate_limiter)
    }

    /// Creates a manager sharing an externally owned rate limiter, so
    /// several engines can pace requests against the same hosts together.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::Config` for out-of-range concurrency values
    /// or when the HTTP client cannot be built.
    #[instrument(skip_all)]
    pub fn with_rate_limiter(
        config: EngineConfig,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, DownloadError> {
        validate_concurrency(config.max_concurrent)?;
        let folder_concurrent = config.folder_concurrent.unwrap_or(config.max_concurrent);
        validate_concurrency(folder_concurrent)?;

        let retry_policy = RetryPolicy::with_max_attempts(config.max_retries.max(1));
        let client = HttpClient::with_timeouts(
            rate_limiter,
            retry_policy,
            config.connect_timeout_secs,
            config.read_timeout_secs,
        )?;

        debug!(
            max_concurrent = config.max_concurrent,
            folder_concurrent, "creating download manager"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            folder_semaphore: Arc::new(Semaphore::new(folder_concurrent)),
            config,
            client,
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
            resolvers: vec![Arc::new(DirectResolver::new())],
            progress_callback: None,
        })
    }

    /// Registers a resolver ahead of the built-in ones, so it gets first
    /// claim on URLs it can handle.
    pub fn register_resolver(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolvers.insert(0, resolver);
    }

    /// Sets the callback that receives rate-limited progress snapshots for
    /// every task.
    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    /// The engine configuration in effect.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates and registers a task for a file, reserving its output path.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` when the description is invalid, the output
    /// directory cannot be created, or no collision-free name is available.
    #[instrument(skip(self), fields(url = %info.download_url()))]
    pub fn create_task(&self, info: FileInfo) -> Result<Arc<DownloadTask>, DownloadError> {
        info.validate()?;

        let mut dest_dir = self.config.output_dir.clone();
        if let Some(folder) = info.parent_folder.as_deref() {
            for segment in folder.split('/').filter(|s| !s.is_empty()) {
                dest_dir.push(sanitize_filename(segment));
            }
        }
        std::fs::create_dir_all(&dest_dir).map_err(|e| DownloadError::io(&dest_dir, e))?;

        let filename = if info.filename.trim().is_empty() {
            let url = url::Url::parse(info.download_url())
                .map_err(|_| DownloadError::invalid_url(info.download_url()))?;
            fallback_filename_from_url(&url)
        } else {
            info.filename.clone()
        };
        let output_path = reserve_unique_path(&dest_dir, &filename)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(DownloadTask::new(id, info, output_path));
        self.tasks.insert(id, Arc::clone(&task));
        debug!(task_id = id, path = %task.output_path.display(), "task created");
        Ok(task)
    }

    /// Downloads a single file to completion, retrying recoverable failures
    /// within the configured attempt budget.
    pub async fn download(&self, info: FileInfo) -> DownloadResult {
        match self.create_task(info) {
            Ok(task) => self.download_task(task).await,
            Err(e) => {
                warn!(error = %e, "could not create download task");
                self.failed_placeholder_result(e)
            }
        }
    }

    /// Runs an already-created task to completion.
    #[instrument(skip_all, fields(task_id = task.id))]
    pub async fn download_task(&self, task: Arc<DownloadTask>) -> DownloadResult {
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return DownloadResult::failed(task, "download engine shut down");
        };

        let max_attempts = self.config.max_retries.max(1);
        let mut attempt: u32 = 0;

        loop {
            let result = transfer::run(
                &self.client,
                &task,
                &self.config,
                self.progress_callback.as_ref(),
            )
            .await;

            let error = match result {
                Ok(()) => {
                    info!(task_id = task.id, "download succeeded");
                    return DownloadResult::succeeded(task);
                }
                Err(e) => e,
            };

            if matches!(error, DownloadError::Cancelled { .. }) {
                info!(task_id = task.id, "download cancelled");
                // Free the reserved name; the `.part` file stays for resume
                self.discard_placeholder(&task).await;
                return DownloadResult::cancelled(task);
            }

            let failure = classify_error(&error);
            let recoverable =
                matches!(failure, FailureType::Transient | FailureType::RateLimited);

            if recoverable && attempt + 1 < max_attempts {
                // Reset to Pending so observers see the task waiting for its
                // next attempt rather than stuck mid-download
                task.record_retry();
                task.set_status(DownloadStatus::Pending);
                let backoff = Duration::from_secs(2u64.pow(attempt.min(6)));
                warn!(
                    task_id = task.id,
                    attempt = attempt + 1,
                    backoff_secs = backoff.as_secs(),
                    error = %error,
                    "transfer attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            warn!(task_id = task.id, error = %error, "download failed");
            task.set_error(error.to_string());
            task.set_status(DownloadStatus::Failed);
            self.discard_placeholder(&task).await;
            return DownloadResult::failed(task, error.to_string());
        }
    }

    /// Resolves a URL and downloads everything it names.
    ///
    /// A file URL yields one result; a folder URL yields one result per
    /// member file, downloaded concurrently under the folder cap. A sibling
    /// failure never aborts the rest.
    #[instrument(skip(self))]
    pub async fn download_url(&self, url: &str) -> Vec<DownloadResult> {
        let Some(resolver) = self.resolvers.iter().find(|r| r.can_handle(url)) else {
            warn!(url, "no resolver can handle URL");
            return vec![
                self.failed_placeholder_result(DownloadError::invalid_url(url)),
            ];
        };
        debug!(resolver = resolver.name(), "resolving URL");

        let resolved = match resolver.resolve(url, &self.client).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(url, error = %e, "resolution failed");
                return vec![self.failed_placeholder_result(e)];
            }
        };

        match resolved {
            Resolved::File(info) => vec![self.download(info).await],
            Resolved::Folder(folder) => {
                let files = folder.flatten();
                info!(
                    folder = %folder.name,
                    files = files.len(),
                    "downloading folder"
                );
                join_all(files.into_iter().map(|file| {
                    let folder_semaphore = Arc::clone(&self.folder_semaphore);
                    async move {
                        let Ok(_permit) = folder_semaphore.acquire_owned().await else {
                            return self
                                .failed_placeholder_result(DownloadError::config(
                                    "download engine shut down",
                                ));
                        };
                        self.download(file).await
                    }
                }))
                .await
            }
        }
    }

    /// Downloads a batch of URLs concurrently. Failures are isolated per
    /// URL; the result order is unspecified.
    pub async fn download_many(&self, urls: &[String]) -> Vec<DownloadResult> {
        join_all(urls.iter().map(|url| self.download_url(url)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Requests suspension of a task. Returns false for unknown ids.
    pub fn pause(&self, task_id: u64) -> bool {
        self.tasks.get(&task_id).is_some_and(|task| {
            task.pause();
            true
        })
    }

    /// Lifts a task's pause. Returns false for unknown ids.
    pub fn resume(&self, task_id: u64) -> bool {
        self.tasks.get(&task_id).is_some_and(|task| {
            task.resume();
            true
        })
    }

    /// Requests cancellation of a task. Returns false for unknown ids.
    pub fn cancel(&self, task_id: u64) -> bool {
        self.tasks.get(&task_id).is_some_and(|task| {
            task.cancel();
            true
        })
    }

    /// Looks up a task by id.
    #[must_use]
    pub fn get_task(&self, task_id: u64) -> Option<Arc<DownloadTask>> {
        self.tasks.get(&task_id).map(|entry| Arc::clone(&entry))
    }

    /// Snapshot of every task the manager has created.
    #[must_use]
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Removes the zero-byte path reservation left behind by a task that
    /// never produced output.
    async fn discard_placeholder(&self, task: &DownloadTask) {
        if let Ok(meta) = tokio::fs::metadata(&task.output_path).await
            && meta.len() == 0
        {
            let _ = tokio::fs::remove_file(&task.output_path).await;
        }
    }

    /// Builds a failed result for work that never became a real task.
    fn failed_placeholder_result(&self, error: DownloadError) -> DownloadResult {
        let info = FileInfo::new("", "");
        let task = Arc::new(DownloadTask::new(0, info, PathBuf::new()));
        task.set_error(error.to_string());
        task.set_status(DownloadStatus::Failed);
        DownloadResult::failed(task, error.to_string())
    }
}

fn validate_concurrency(value: usize) -> Result<(), DownloadError> {
    if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
        Ok(())
    } else {
        Err(DownloadError::config(format!(
            "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
        )))
    }
}
