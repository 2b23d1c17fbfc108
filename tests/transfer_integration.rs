//! End-to-end transfer behavior against a mock HTTP server: resume,
//! verification, decryption, and failure handling.

use std::sync::Arc;

use aes::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use binfetch::{DownloadManager, DownloadStatus, EngineConfig, FileInfo};

fn test_config(output_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        output_dir: output_dir.to_path_buf(),
        requests_per_second: 0.0,
        max_retries: 1,
        ..EngineConfig::default()
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

async fn mount_file(server: &MockServer, route: &str, body: &[u8]) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", body.len().to_string().as_str())
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn download_with_matching_checksum_succeeds() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..200u8).cycle().take(50_000).collect();
    mount_file(&server, "/data.bin", &body).await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let mut info = FileInfo::new(format!("{}/data.bin", server.uri()), "data.bin");
    info.checksum = Some(sha256_hex(&body));

    let result = manager.download(info).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(std::fs::read(&result.task.output_path).unwrap(), body);
}

#[tokio::test]
async fn checksum_mismatch_fails_and_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = vec![9u8; 10_000];
    mount_file(&server, "/bad.bin", &body).await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let mut info = FileInfo::new(format!("{}/bad.bin", server.uri()), "bad.bin");
    info.checksum = Some("00".repeat(32));

    let result = manager.download(info).await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("checksum"));
    assert!(!result.task.part_path().exists());
    assert!(!result.task.output_path.exists());
}

#[tokio::test]
async fn truncated_body_fails_size_verification() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    // Server claims 1000 bytes via HEAD but delivers only 400
    Mock::given(method("HEAD"))
        .and(path("/short.bin"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-length", "1000"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/short.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 400]))
        .mount(&server)
        .await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let result = manager
        .download(FileInfo::new(
            format!("{}/short.bin", server.uri()),
            "short.bin",
        ))
        .await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("integrity"));
    assert!(!result.task.output_path.exists());
}

#[tokio::test]
async fn resume_sends_range_and_appends_to_partial_file() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let prefix = &body[..400];
    let tail = &body[400..];

    Mock::given(method("HEAD"))
        .and(path("/resume.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", "1000")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resume.bin"))
        .and(header("range", "bytes=400-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 400-999/1000")
                .set_body_bytes(tail.to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let mut info = FileInfo::new(format!("{}/resume.bin", server.uri()), "resume.bin");
    info.checksum = Some(sha256_hex(&body));
    let task = manager.create_task(info).unwrap();

    // Leftover partial file from an interrupted earlier attempt
    std::fs::write(task.part_path(), prefix).unwrap();

    let result = manager.download_task(task).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(std::fs::read(&result.task.output_path).unwrap(), body);
}

#[tokio::test]
async fn resume_restarts_when_server_ignores_range() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = vec![5u8; 1000];

    Mock::given(method("HEAD"))
        .and(path("/noresume.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", "1000")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;
    // Answers 200 with the whole body even though a range was requested
    Mock::given(method("GET"))
        .and(path("/noresume.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let task = manager
        .create_task(FileInfo::new(
            format!("{}/noresume.bin", server.uri()),
            "noresume.bin",
        ))
        .unwrap();
    std::fs::write(task.part_path(), vec![1u8; 400]).unwrap();

    let result = manager.download_task(task).await;
    assert!(result.success, "error: {:?}", result.error);
    // Full body, not 400 stale bytes plus 1000 fresh ones
    assert_eq!(std::fs::read(&result.task.output_path).unwrap(), body);
}

#[tokio::test]
async fn encrypted_download_discards_partial_and_decrypts() {
    type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    let key = [0x11u8; 16];
    let iv = [0x22u8; 16];
    let plaintext: Vec<u8> = (0..100u8).cycle().take(20_000).collect();
    let mut ciphertext = plaintext.clone();
    Aes128Ctr::new(&key.into(), &iv.into()).apply_keystream(&mut ciphertext);

    mount_file(&server, "/blob.enc", &ciphertext).await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let mut info = FileInfo::new(format!("{}/blob.enc", server.uri()), "blob.bin");
    info.encrypted = true;
    info.encryption_key = Some(key.to_vec());
    info.encryption_iv = Some(iv.to_vec());
    info.checksum = Some(sha256_hex(&plaintext));
    let task = manager.create_task(info).unwrap();

    // Encrypted transfers can never resume; stale partial bytes must go
    std::fs::write(task.part_path(), vec![0u8; 512]).unwrap();

    let result = manager.download_task(task).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(std::fs::read(&result.task.output_path).unwrap(), plaintext);
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/gone.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.bin"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let config = EngineConfig {
        max_retries: 3,
        ..test_config(dir.path())
    };
    let manager = DownloadManager::new(config).unwrap();
    let result = manager
        .download(FileInfo::new(
            format!("{}/gone.bin", server.uri()),
            "gone.bin",
        ))
        .await;

    assert!(!result.success);
    assert_eq!(result.task.status(), DownloadStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("404"));
}

#[tokio::test]
async fn rate_limited_request_honors_retry_after_then_succeeds() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = b"slow down".to_vec();

    Mock::given(method("HEAD"))
        .and(path("/busy.bin"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy.bin"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let config = EngineConfig {
        max_retries: 3,
        ..test_config(dir.path())
    };
    let manager = DownloadManager::new(config).unwrap();

    let started = std::time::Instant::now();
    let result = manager
        .download(FileInfo::new(
            format!("{}/busy.bin", server.uri()),
            "busy.bin",
        ))
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(
        started.elapsed() >= std::time::Duration::from_millis(900),
        "must wait out Retry-After, took {:?}",
        started.elapsed()
    );
    assert_eq!(std::fs::read(&result.task.output_path).unwrap(), body);
}

#[tokio::test]
async fn impossible_size_fails_disk_check_before_transfer() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/huge.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", u64::MAX.to_string().as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/huge.bin"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let result = manager
        .download(FileInfo::new(
            format!("{}/huge.bin", server.uri()),
            "huge.bin",
        ))
        .await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("disk space"));
}

#[tokio::test]
async fn unknown_size_download_still_completes() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = vec![3u8; 5000];
    // No content-length on the probe; size is learned from the GET
    Mock::given(method("HEAD"))
        .and(path("/mystery.bin"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mystery.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let result = manager
        .download(FileInfo::new(
            format!("{}/mystery.bin", server.uri()),
            "mystery.bin",
        ))
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(std::fs::read(&result.task.output_path).unwrap(), body);
}

#[tokio::test]
async fn progress_reports_completed_status_and_byte_count() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = vec![8u8; 30_000];
    mount_file(&server, "/watched.bin", &body).await;

    let mut manager = DownloadManager::new(test_config(dir.path())).unwrap();
    let updates: Arc<std::sync::Mutex<Vec<binfetch::ProgressUpdate>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    manager.set_progress_callback(Arc::new(move |update| {
        sink.lock().unwrap().push(update);
    }));

    let result = manager
        .download(FileInfo::new(
            format!("{}/watched.bin", server.uri()),
            "watched.bin",
        ))
        .await;
    assert!(result.success, "error: {:?}", result.error);

    let updates = updates.lock().unwrap();
    assert!(!updates.is_empty());
    let last = updates.last().unwrap();
    assert_eq!(last.status, DownloadStatus::Completed);
    assert_eq!(last.downloaded, 30_000);
    assert_eq!(last.total, 30_000);
}
