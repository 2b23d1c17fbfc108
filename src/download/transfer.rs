//! Single-file transfer state machine.
//!
//! One [`run`] call takes a task from probe to verified completion: probe
//! metadata, check disk space, decide whether to resume the `.part` file,
//! stream the body chunk by chunk (decrypting and hashing in flight), then
//! verify and atomically move the finished file into place.
//!
//! Failure cleanup policy: recoverable interruptions (network, timeout,
//! cancel) keep the `.part` file so a later attempt can resume; data-level
//! failures (disk space, size or checksum mismatch) and encrypted transfers
//! remove it, since their bytes cannot be trusted or reused.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::checksum::{ChecksumAlgorithm, ChecksumHasher, digests_match};
use super::client::{ChunkPull, HttpClient};
use super::constants::SPEED_EMA_WEIGHT;
use super::crypto::Decryptor;
use super::engine::EngineConfig;
use super::error::DownloadError;
use super::task::{DownloadStatus, DownloadTask, ProgressCallback};

/// Runs one transfer attempt for a task.
///
/// # Errors
///
/// Returns the error that ended the attempt; the caller decides whether the
/// whole transfer is retried. The `.part` file is kept or removed per the
/// module cleanup policy before this returns.
#[instrument(skip_all, fields(task_id = task.id, url = %task.info.download_url()))]
pub(crate) async fn run(
    client: &HttpClient,
    task: &Arc<DownloadTask>,
    config: &EngineConfig,
    on_progress: Option<&ProgressCallback>,
) -> Result<(), DownloadError> {
    let result = execute(client, task, config, on_progress).await;
    if let Err(error) = &result {
        cleanup_after_failure(task, error).await;
    }
    result
}

async fn execute(
    client: &HttpClient,
    task: &Arc<DownloadTask>,
    config: &EngineConfig,
    on_progress: Option<&ProgressCallback>,
) -> Result<(), DownloadError> {
    let info = &task.info;
    let url = info.download_url();
    let part_path = task.part_path();

    let mut decryptor = Decryptor::for_file(info)?;
    let checksum_plan = checksum_plan(info)?;

    // A declared size lets us refuse before touching the network at all.
    check_disk_space(task, info.size, 0)?;

    // Probe for size and range support. Some origins reject HEAD; fall back
    // to what the task already knows and let the GET decide.
    let (mut total, supports_range) = match client.fetch_metadata(url, &info.headers).await {
        Ok(meta) => {
            let total = if meta.size > 0 { meta.size } else { info.size };
            (total, meta.supports_range)
        }
        Err(e) if e.is_terminal() => return Err(e),
        Err(e) => {
            warn!(error = %e, "metadata probe failed, proceeding without it");
            (info.size, false)
        }
    };

    let mut resume_offset =
        plan_resume(task, &part_path, config, total, supports_range, &decryptor).await;

    check_disk_space(task, total, resume_offset)?;

    let mut stream = client
        .open_stream(url, &info.headers, &info.cookies, resume_offset)
        .await?;

    if resume_offset > 0 && !stream.resumed() {
        debug!("server ignored range request, restarting from zero");
        resume_offset = 0;
    }

    // The digest covers the payload from offset zero, so a resumed transfer
    // replays the existing bytes through the hasher first.
    let mut hasher = match checksum_plan {
        Some((algorithm, _)) if resume_offset > 0 => {
            Some(prehash_existing(&part_path, algorithm, resume_offset).await?)
        }
        Some((algorithm, _)) => Some(algorithm.hasher()),
        None => None,
    };

    if total == 0
        && let Some(length) = stream.content_length()
    {
        total = length;
        check_disk_space(task, total, resume_offset)?;
    }

    let file = if resume_offset > 0 {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&part_path)
            .await
            .map_err(|e| DownloadError::io(&part_path, e))?
    } else {
        File::create(&part_path)
            .await
            .map_err(|e| DownloadError::io(&part_path, e))?
    };
    let mut writer = BufWriter::new(file);

    let mut downloaded = resume_offset;
    let mut speed_bps = 0.0_f64;
    task.set_status(DownloadStatus::Downloading);
    task.update_progress(|p| {
        p.downloaded = downloaded;
        p.total = total;
        p.speed_bps = 0.0;
        p.error = None;
    });
    emit_progress(task, on_progress);

    let started = Instant::now();
    let mut last_chunk_at = started;
    let mut last_emit = Instant::now();
    let emit_interval = Duration::from_millis(config.progress_interval_ms);
    let chunk_timeout = Duration::from_secs(config.chunk_timeout_secs);
    let mut timeout_strikes: u32 = 0;

    loop {
        if task.is_cancelled() {
            let _ = writer.flush().await;
            task.set_status(DownloadStatus::Cancelled);
            emit_progress(task, on_progress);
            return Err(DownloadError::cancelled(url));
        }

        if task.is_paused() {
            writer
                .flush()
                .await
                .map_err(|e| DownloadError::io(&part_path, e))?;
            task.set_status(DownloadStatus::Paused);
            emit_progress(task, on_progress);
            debug!("transfer paused");

            task.control.wait_while_paused().await;

            if task.is_cancelled() {
                task.set_status(DownloadStatus::Cancelled);
                emit_progress(task, on_progress);
                return Err(DownloadError::cancelled(url));
            }
            task.set_status(DownloadStatus::Downloading);
            emit_progress(task, on_progress);
            last_chunk_at = Instant::now();
            debug!("transfer resumed");
        }

        let pull = match tokio::time::timeout(chunk_timeout, stream.pull()).await {
            Ok(pull) => pull,
            Err(_) => {
                timeout_strikes += 1;
                if timeout_strikes > config.chunk_retries {
                    let _ = writer.flush().await;
                    return Err(DownloadError::timeout(url));
                }
                warn!(strike = timeout_strikes, "chunk pull timed out, retrying");
                tokio::time::sleep(Duration::from_millis(500 * u64::from(timeout_strikes))).await;
                continue;
            }
        };

        let chunk = match pull {
            ChunkPull::Chunk(chunk) => chunk,
            ChunkPull::Exhausted => break,
            ChunkPull::Failed(e) => {
                let _ = writer.flush().await;
                return Err(e);
            }
        };
        timeout_strikes = 0;

        // Decrypt in arrival order; the keystream offset tracks the byte
        // position, so chunks are never reordered or skipped.
        let mut buf = chunk.to_vec();
        decryptor.apply(&mut buf);

        if let Err(e) = writer.write_all(&buf).await {
            return Err(write_error(&part_path, e));
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf);
        }
        downloaded += buf.len() as u64;

        // Exponential moving average over per-chunk instantaneous rates
        let now = Instant::now();
        let dt = now.duration_since(last_chunk_at).as_secs_f64();
        if dt > 0.0 {
            let instantaneous = buf.len() as f64 / dt;
            speed_bps = if speed_bps == 0.0 {
                instantaneous
            } else {
                SPEED_EMA_WEIGHT * instantaneous + (1.0 - SPEED_EMA_WEIGHT) * speed_bps
            };
        }
        last_chunk_at = now;

        task.update_progress(|p| {
            p.downloaded = downloaded;
            p.total = total;
            p.speed_bps = speed_bps;
        });
        if last_emit.elapsed() >= emit_interval {
            emit_progress(task, on_progress);
            last_emit = Instant::now();
        }

        if let Some(limit) = config.speed_limit
            && limit > 0
        {
            let expected = (downloaded - resume_offset) as f64 / limit as f64;
            let actual = started.elapsed().as_secs_f64();
            if expected > actual {
                tokio::time::sleep(Duration::from_secs_f64(expected - actual)).await;
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(&part_path, e))?;
    drop(writer);

    if total > 0 && downloaded != total {
        return Err(DownloadError::integrity(&part_path, total, downloaded));
    }

    if let (Some(hasher), Some((_, expected))) = (hasher, checksum_plan) {
        let actual = hasher.finalize_hex();
        if !digests_match(expected, &actual) {
            return Err(DownloadError::checksum(&part_path, expected, actual));
        }
        debug!(digest = %actual, "checksum verified");
    }

    // Atomically replaces the zero-byte placeholder reserved at task creation
    tokio::fs::rename(&part_path, &task.output_path)
        .await
        .map_err(|e| DownloadError::io(&task.output_path, e))?;

    task.set_status(DownloadStatus::Completed);
    task.update_progress(|p| {
        p.downloaded = downloaded;
        p.total = total;
    });
    emit_progress(task, on_progress);

    info!(
        path = %task.output_path.display(),
        bytes = downloaded,
        resumed = resume_offset > 0,
        "download complete"
    );
    Ok(())
}

/// Decides the resume offset for this attempt, deleting the `.part` file
/// when its bytes cannot be reused.
async fn plan_resume(
    task: &DownloadTask,
    part_path: &Path,
    config: &EngineConfig,
    total: u64,
    supports_range: bool,
    decryptor: &Decryptor,
) -> u64 {
    let existing = tokio::fs::metadata(part_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if existing == 0 {
        return 0;
    }

    if decryptor.is_active() {
        // The keystream is bound to offset zero; partial ciphertext output
        // cannot be continued
        debug!(existing, "discarding partial file of encrypted transfer");
        let _ = tokio::fs::remove_file(part_path).await;
        return 0;
    }
    if !config.enable_resume {
        let _ = tokio::fs::remove_file(part_path).await;
        return 0;
    }
    if total > 0 && existing >= total {
        // Stale leftover from a different payload; cannot trust it
        warn!(existing, total, "partial file exceeds expected size, restarting");
        let _ = tokio::fs::remove_file(part_path).await;
        return 0;
    }
    if !supports_range {
        let _ = tokio::fs::remove_file(part_path).await;
        return 0;
    }

    debug!(existing, task_id = task.id, "resuming from partial file");
    existing
}

/// Feeds the existing partial bytes through a fresh hasher so the digest
/// stays aligned with the payload from offset zero.
async fn prehash_existing(
    part_path: &Path,
    algorithm: ChecksumAlgorithm,
    expected_len: u64,
) -> Result<ChecksumHasher, DownloadError> {
    let mut hasher = algorithm.hasher();
    let mut file = File::open(part_path)
        .await
        .map_err(|e| DownloadError::io(part_path, e))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut fed: u64 = 0;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| DownloadError::io(part_path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        fed += n as u64;
    }

    if fed != expected_len {
        warn!(fed, expected_len, "partial file changed size during prehash");
    }
    Ok(hasher)
}

/// Resolves the declared checksum into an algorithm and expected digest.
///
/// When the algorithm is not declared it is inferred from the digest length
/// (32 hex chars for MD5, 64 for SHA-256).
fn checksum_plan(
    info: &super::task::FileInfo,
) -> Result<Option<(ChecksumAlgorithm, &str)>, DownloadError> {
    let Some(expected) = info.checksum.as_deref() else {
        return Ok(None);
    };
    let expected = expected.trim();

    let algorithm = match info.checksum_algorithm {
        Some(algorithm) => algorithm,
        None => match expected.len() {
            32 => ChecksumAlgorithm::Md5,
            64 => ChecksumAlgorithm::Sha256,
            len => {
                return Err(DownloadError::config(format!(
                    "cannot infer checksum algorithm from {len}-char digest"
                )));
            }
        },
    };
    Ok(Some((algorithm, expected)))
}

/// Fails fast when the destination volume cannot hold the remaining bytes.
fn check_disk_space(
    task: &DownloadTask,
    total: u64,
    resume_offset: u64,
) -> Result<(), DownloadError> {
    if total == 0 {
        return Ok(());
    }
    let required = total.saturating_sub(resume_offset);
    let Some(parent) = task.output_path.parent() else {
        return Ok(());
    };

    match fs2::available_space(parent) {
        Ok(available) if available < required => Err(DownloadError::disk_space(
            &task.output_path,
            required,
            available,
        )),
        Ok(_) => Ok(()),
        Err(e) => {
            // Some filesystems cannot answer; the write path still catches
            // a full disk
            debug!(error = %e, "disk space check unavailable");
            Ok(())
        }
    }
}

/// Maps a write failure, promoting a full disk to the dedicated error kind.
fn write_error(part_path: &Path, error: std::io::Error) -> DownloadError {
    let out_of_space = error.kind() == std::io::ErrorKind::StorageFull
        || error.raw_os_error() == Some(28);
    if out_of_space {
        let available = part_path
            .parent()
            .and_then(|p| fs2::available_space(p).ok())
            .unwrap_or(0);
        DownloadError::disk_space(part_path, 0, available)
    } else {
        DownloadError::io(part_path, error)
    }
}

/// Applies the cleanup policy after a failed attempt.
async fn cleanup_after_failure(task: &DownloadTask, error: &DownloadError) {
    let remove = task.info.encrypted
        || matches!(
            error,
            DownloadError::DiskSpace { .. }
                | DownloadError::Integrity { .. }
                | DownloadError::Checksum { .. }
        );
    if remove {
        let part_path = task.part_path();
        debug!(path = %part_path.display(), "removing unusable partial file");
        let _ = tokio::fs::remove_file(&part_path).await;
    }
}

fn emit_progress(task: &DownloadTask, on_progress: Option<&ProgressCallback>) {
    if let Some(callback) = on_progress {
        callback(task.progress_update());
    }
}
