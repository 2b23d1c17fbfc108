//! Stalled-stream behavior: a transfer must recover from a brief mid-body
//! stall, survive slow delivery that outlasts the read timeout, and fail in
//! bounded time when the origin stops sending for good.
//!
//! Uses a raw TCP server because mock frameworks cannot hold a response
//! body open mid-stream.

use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use binfetch::{DownloadManager, EngineConfig, FileInfo};

/// Serves HEAD with `Connection: close`, then answers each GET with a body
/// whose delivery is shaped by `stall`.
async fn serve(listener: TcpListener, content_length: usize, stall: StallMode) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };

        let mut buf = vec![0u8; 4096];
        let mut request = Vec::new();
        loop {
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        if request.starts_with(b"HEAD") {
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {content_length}\r\nconnection: close\r\n\r\n"
            );
            let _ = socket.write_all(response.as_bytes()).await;
            continue;
        }

        let header = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {content_length}\r\nconnection: close\r\n\r\n"
        );
        let _ = socket.write_all(header.as_bytes()).await;

        match stall {
            StallMode::Forever => {
                let _ = socket.write_all(&vec![0xabu8; content_length / 2]).await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_secs(120)).await;
            }
            StallMode::Briefly(pause) => {
                let half = content_length / 2;
                let _ = socket.write_all(&vec![0xabu8; half]).await;
                let _ = socket.flush().await;
                tokio::time::sleep(pause).await;
                let _ = socket.write_all(&vec![0xabu8; content_length - half]).await;
                let _ = socket.flush().await;
            }
            StallMode::Dribble { pieces, gap } => {
                let piece = content_length / pieces;
                let mut sent = 0;
                for i in 0..pieces {
                    if i > 0 {
                        tokio::time::sleep(gap).await;
                    }
                    let len = if i + 1 == pieces {
                        content_length - sent
                    } else {
                        piece
                    };
                    let _ = socket.write_all(&vec![0xabu8; len]).await;
                    let _ = socket.flush().await;
                    sent += len;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum StallMode {
    Forever,
    Briefly(Duration),
    Dribble { pieces: usize, gap: Duration },
}

fn stall_config(output_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        output_dir: output_dir.to_path_buf(),
        requests_per_second: 0.0,
        max_retries: 1,
        chunk_timeout_secs: 1,
        chunk_retries: 3,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn transfer_recovers_from_brief_mid_body_stall() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(
        listener,
        10_000,
        StallMode::Briefly(Duration::from_millis(1500)),
    ));

    let manager = DownloadManager::new(stall_config(dir.path())).unwrap();
    let result = manager
        .download(FileInfo::new(
            format!("http://{addr}/stalls.bin"),
            "stalls.bin",
        ))
        .await;

    assert!(result.success, "error: {:?}", result.error);
    let written = std::fs::read(&result.task.output_path).unwrap();
    assert_eq!(written.len(), 10_000);
    assert!(written.iter().all(|&b| b == 0xab));
}

#[tokio::test]
async fn transfer_outlasting_read_timeout_completes_while_bytes_flow() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Six pieces with 400ms gaps take well past the 1s read timeout, but no
    // single gap exceeds it
    tokio::spawn(serve(
        listener,
        12_000,
        StallMode::Dribble {
            pieces: 6,
            gap: Duration::from_millis(400),
        },
    ));

    let config = EngineConfig {
        read_timeout_secs: 1,
        ..stall_config(dir.path())
    };
    let manager = DownloadManager::new(config).unwrap();

    let started = Instant::now();
    let result = manager
        .download(FileInfo::new(
            format!("http://{addr}/dribble.bin"),
            "dribble.bin",
        ))
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(
        started.elapsed() > Duration::from_secs(1),
        "transfer was expected to take longer than the read timeout"
    );
    let written = std::fs::read(&result.task.output_path).unwrap();
    assert_eq!(written.len(), 12_000);
}

#[tokio::test]
async fn permanently_stalled_transfer_fails_in_bounded_time() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, 10_000, StallMode::Forever));

    let config = EngineConfig {
        chunk_retries: 1,
        ..stall_config(dir.path())
    };
    let manager = DownloadManager::new(config).unwrap();

    let started = Instant::now();
    let result = manager
        .download(FileInfo::new(format!("http://{addr}/dead.bin"), "dead.bin"))
        .await;

    assert!(!result.success);
    assert!(
        result.error.as_deref().unwrap().contains("timeout"),
        "expected a timeout failure, got {:?}",
        result.error
    );
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "stalled transfer must fail in bounded time, took {:?}",
        started.elapsed()
    );

    // Partial bytes are kept for a later resume attempt
    assert!(result.task.part_path().exists());
}
