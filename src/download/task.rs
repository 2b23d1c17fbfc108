//! Data model for downloads: file descriptions, task state, and results.
//!
//! A [`FileInfo`] describes what to fetch; a [`DownloadTask`] is the live
//! handle the engine creates for it, carrying mutable progress and the
//! pause/cancel control surface; a [`DownloadResult`] is the terminal
//! snapshot returned to callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::checksum::ChecksumAlgorithm;
use super::crypto::Decryptor;
use super::error::DownloadError;

/// Description of a single remote file to download.
///
/// Produced by resolvers or constructed directly by callers. `size == 0`
/// means the size is unknown until the transport probes the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Source page or API URL the file came from.
    pub url: String,

    /// Direct payload URL when it differs from `url` (e.g. a CDN link a
    /// resolver extracted). The transfer fetches this when present.
    pub direct_url: Option<String>,

    /// Suggested output filename. Treated as untrusted and sanitized.
    pub filename: String,

    /// Expected payload size in bytes; 0 when unknown.
    #[serde(default)]
    pub size: u64,

    /// Declared digest of the decrypted payload, hex-encoded.
    #[serde(default)]
    pub checksum: Option<String>,

    /// Algorithm for `checksum`.
    #[serde(default)]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,

    /// Extra request headers for this file.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request cookies for this file.
    #[serde(default)]
    pub cookies: HashMap<String, String>,

    /// Whether the payload travels encrypted (AES-CTR).
    #[serde(default)]
    pub encrypted: bool,

    /// AES key for encrypted payloads (16, 24, or 32 bytes).
    #[serde(default)]
    pub encryption_key: Option<Vec<u8>>,

    /// AES-CTR IV for encrypted payloads (16 bytes).
    #[serde(default)]
    pub encryption_iv: Option<Vec<u8>>,

    /// Folder name this file belongs to, used as an output subdirectory.
    #[serde(default)]
    pub parent_folder: Option<String>,
}

impl FileInfo {
    /// Creates a minimal file description.
    #[must_use]
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            direct_url: None,
            filename: filename.into(),
            size: 0,
            checksum: None,
            checksum_algorithm: None,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            encrypted: false,
            encryption_key: None,
            encryption_iv: None,
            parent_folder: None,
        }
    }

    /// URL the payload is actually fetched from.
    #[must_use]
    pub fn download_url(&self) -> &str {
        self.direct_url.as_deref().unwrap_or(&self.url)
    }

    /// Validates the description before any I/O happens.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::InvalidUrl` for an unparseable URL and
    /// `DownloadError::Config` when an encrypted source is missing or
    /// carrying malformed key material.
    pub fn validate(&self) -> Result<(), DownloadError> {
        let target = self.download_url();
        url::Url::parse(target).map_err(|_| DownloadError::invalid_url(target))?;

        // Surfaces missing/malformed key material before any network I/O
        Decryptor::for_file(self).map(|_| ())
    }
}

/// A folder of files produced by a resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderInfo {
    /// Source URL of the folder listing.
    pub url: String,

    /// Folder name; becomes an output subdirectory for its members.
    pub name: String,

    /// Member files.
    #[serde(default)]
    pub files: Vec<FileInfo>,

    /// Nested folders.
    #[serde(default)]
    pub subfolders: Vec<FolderInfo>,
}

impl FolderInfo {
    /// Flattens the folder tree into file descriptions, tagging each with
    /// its folder path (e.g. `album/disc2`) as `parent_folder`.
    #[must_use]
    pub fn flatten(&self) -> Vec<FileInfo> {
        let mut out = Vec::new();
        self.collect_into(&self.name, &mut out);
        out
    }

    fn collect_into(&self, prefix: &str, out: &mut Vec<FileInfo>) {
        for file in &self.files {
            let mut file = file.clone();
            file.parent_folder = Some(prefix.to_string());
            out.push(file);
        }
        for sub in &self.subfolders {
            let nested = format!("{prefix}/{}", sub.name);
            sub.collect_into(&nested, out);
        }
    }
}

/// Lifecycle states of a download task.
///
/// ```text
/// Pending -> Downloading -> { Paused <-> Downloading } -> Completed | Failed
/// Cancelled is reachable from any non-terminal state.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Created but not yet transferring.
    Pending,
    /// Actively streaming bytes.
    Downloading,
    /// Suspended by the caller; resumable.
    Paused,
    /// Finished and verified.
    Completed,
    /// Terminally failed.
    Failed,
    /// Stopped by the caller.
    Cancelled,
}

impl DownloadStatus {
    /// Returns true for states that end the task's lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use DownloadStatus::{Cancelled, Completed, Downloading, Failed, Paused, Pending};
        match (self, next) {
            // Cancellation is reachable from any non-terminal state
            (from, Cancelled) if !from.is_terminal() => true,
            (Pending, Downloading | Failed) => true,
            (Downloading, Paused | Completed | Failed | Pending) => true,
            (Paused, Downloading | Failed) => true,
            _ => false,
        }
    }
}

/// Mutable progress of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    /// Current lifecycle state.
    pub status: DownloadStatus,
    /// Bytes written so far (including a resumed prefix).
    pub downloaded: u64,
    /// Total payload size; 0 while unknown.
    pub total: u64,
    /// Smoothed transfer speed in bytes per second.
    pub speed_bps: f64,
    /// Terminal error message, when failed.
    pub error: Option<String>,
    /// Whole-transfer retry attempts consumed.
    pub retries: u32,
}

impl Progress {
    fn new(total: u64) -> Self {
        Self {
            status: DownloadStatus::Pending,
            downloaded: 0,
            total,
            speed_bps: 0.0,
            error: None,
            retries: 0,
        }
    }
}

/// Snapshot delivered through a progress callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Task id the update belongs to.
    pub task_id: u64,
    /// Current lifecycle state.
    pub status: DownloadStatus,
    /// Bytes written so far.
    pub downloaded: u64,
    /// Total payload size; 0 while unknown.
    pub total: u64,
    /// Smoothed transfer speed in bytes per second.
    pub speed_bps: f64,
}

/// Callback invoked with rate-limited progress snapshots.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Cooperative pause/cancel controls shared between the engine and a
/// running transfer.
///
/// Pause is signal-based: a paused transfer parks on the notify and is woken
/// by `resume` or `cancel` rather than polling the flag.
#[derive(Debug, Default)]
pub(crate) struct TaskControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    wake: Notify,
}

impl TaskControl {
    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake a paused transfer so it can observe the cancellation
        self.wake.notify_waiters();
    }

    /// Parks until resumed or cancelled. Returns immediately when neither
    /// pause nor cancel is in effect.
    pub(crate) async fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            // Register interest before re-checking to avoid a lost wakeup
            let notified = self.wake.notified();
            if !self.is_paused() || self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

/// Live handle for one download.
///
/// Shared as `Arc<DownloadTask>` between the engine, the running transfer,
/// and callers holding it for control and progress inspection. Progress is
/// mutated only by the owning transfer.
#[derive(Debug)]
pub struct DownloadTask {
    /// Unique task id assigned by the engine.
    pub id: u64,
    /// What is being downloaded.
    pub info: FileInfo,
    /// Reserved final output path.
    pub output_path: PathBuf,
    progress: std::sync::Mutex<Progress>,
    pub(crate) control: TaskControl,
}

impl DownloadTask {
    /// Creates a task handle for a reserved output path.
    #[must_use]
    pub(crate) fn new(id: u64, info: FileInfo, output_path: PathBuf) -> Self {
        let total = info.size;
        Self {
            id,
            info,
            output_path,
            progress: std::sync::Mutex::new(Progress::new(total)),
            control: TaskControl::default(),
        }
    }

    /// Path of the in-flight partial file for this task.
    #[must_use]
    pub fn part_path(&self) -> PathBuf {
        let mut os = self.output_path.as_os_str().to_owned();
        os.push(super::constants::PART_SUFFIX);
        PathBuf::from(os)
    }

    /// Requests suspension. Advisory; the transfer parks at its next chunk
    /// boundary.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Lifts a pause and wakes the parked transfer.
    pub fn resume(&self) {
        self.control.resume();
    }

    /// Requests cancellation. Advisory; the transfer stops at its next
    /// chunk boundary and the task ends `Cancelled`.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Whether a pause request is in effect.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Returns a snapshot of current progress.
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.lock_progress().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.lock_progress().status
    }

    /// Snapshot shaped for progress callbacks.
    #[must_use]
    pub fn progress_update(&self) -> ProgressUpdate {
        let p = self.lock_progress();
        ProgressUpdate {
            task_id: self.id,
            status: p.status,
            downloaded: p.downloaded,
            total: p.total,
            speed_bps: p.speed_bps,
        }
    }

    /// Moves the task to `next` when the state machine allows it.
    pub(crate) fn set_status(&self, next: DownloadStatus) {
        let mut p = self.lock_progress();
        if p.status.can_transition_to(next) {
            p.status = next;
        }
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        self.lock_progress().error = Some(message.into());
    }

    pub(crate) fn record_retry(&self) {
        self.lock_progress().retries += 1;
    }

    /// Applies a mutation to progress under the lock.
    pub(crate) fn update_progress(&self, f: impl FnOnce(&mut Progress)) {
        f(&mut self.lock_progress());
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        // A poisoned lock only means a writer panicked mid-update; the
        // snapshot is still usable.
        self.progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Terminal outcome of one download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Whether the transfer completed and verified.
    pub success: bool,
    /// The task this result belongs to.
    pub task: Arc<DownloadTask>,
    /// Terminal error message, when unsuccessful.
    pub error: Option<String>,
}

impl DownloadResult {
    /// Result for a completed, verified transfer.
    #[must_use]
    pub fn succeeded(task: Arc<DownloadTask>) -> Self {
        Self {
            success: true,
            task,
            error: None,
        }
    }

    /// Result for a terminally failed transfer.
    #[must_use]
    pub fn failed(task: Arc<DownloadTask>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            task,
            error: Some(error.into()),
        }
    }

    /// Result for a cancelled transfer.
    #[must_use]
    pub fn cancelled(task: Arc<DownloadTask>) -> Self {
        Self {
            success: false,
            task,
            error: Some("cancelled".to_string()),
        }
    }
}
