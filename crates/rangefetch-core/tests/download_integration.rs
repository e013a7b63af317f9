//! End-to-end engine tests against a Range-aware mock server

use parking_lot::Mutex;
use rangefetch_core::types::{Configuration, EngineEvent, ErrorKind, JobStatus};
use rangefetch_core::{DownloadJob, DownloadManager, ResumeMetadata, ResumeStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MB: usize = 1024 * 1024;

/// Serves `body`, honouring `Range: bytes=s-e` / `bytes=s-`
struct RangeResponder {
    body: Arc<Vec<u8>>,
    etag: Option<String>,
    /// Start offset of every GET, 0 when no Range header was sent
    starts: Arc<Mutex<Vec<u64>>>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let template = match range {
            Some((start, end)) => {
                let end = end.unwrap_or(len - 1).min(len - 1);
                self.starts.lock().push(start);
                if start >= len {
                    return ResponseTemplate::new(416);
                }
                ResponseTemplate::new(206)
                    .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, len))
            }
            None => {
                self.starts.lock().push(0);
                ResponseTemplate::new(200).set_body_bytes(self.body.to_vec())
            }
        };
        let template = template.insert_header("Accept-Ranges", "bytes");
        match &self.etag {
            Some(etag) => template.insert_header("ETag", etag.as_str()),
            None => template,
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let ranges = value.strip_prefix("bytes=")?;
    let (start, end) = ranges.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

fn test_body(len: usize) -> Arc<Vec<u8>> {
    Arc::new((0..len).map(|i| (i % 251) as u8).collect())
}

/// Mount HEAD + ranged GET for `/file.bin`; returns the recorded GET starts
async fn serve_file(server: &MockServer, body: Arc<Vec<u8>>, etag: Option<&str>) -> Arc<Mutex<Vec<u64>>> {
    let mut head = ResponseTemplate::new(200)
        .insert_header("Accept-Ranges", "bytes")
        .insert_header("Content-Length", body.len().to_string());
    if let Some(etag) = etag {
        head = head.insert_header("ETag", etag);
    }
    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(head)
        .mount(server)
        .await;

    let starts = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(RangeResponder {
            body,
            etag: etag.map(str::to_string),
            starts: Arc::clone(&starts),
        })
        .mount(server)
        .await;
    starts
}

fn test_config() -> Configuration {
    Configuration {
        timeout_ms: 5_000,
        max_retries: 2,
        ..Default::default()
    }
}

fn manager() -> (DownloadManager, broadcast::Receiver<EngineEvent>) {
    let (tx, rx) = broadcast::channel(4096);
    (DownloadManager::new(tx).unwrap(), rx)
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_multi_chunk_download_matches_source() {
    let server = MockServer::start().await;
    let body = test_body(10 * MB);
    let starts = serve_file(&server, Arc::clone(&body), Some("\"v1\"")).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let (manager, _rx) = manager();

    let job = DownloadJob::new(format!("{}/file.bin", server.uri()), &dest).with_config(Configuration {
        chunk_size: MB as u64,
        ..test_config()
    });
    let result = manager.download(job).await.unwrap();

    assert!(result.is_success, "{:?}", result.error_message);
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.total_size, body.len() as u64);
    assert_eq!(result.downloaded_bytes, body.len() as u64);
    assert_eq!(result.transferred_bytes, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), *body);

    // One request per chunk
    let mut starts = starts.lock().clone();
    starts.sort_unstable();
    assert_eq!(starts.len(), 4);
    assert_eq!(starts[0], 0);

    let store = ResumeStore::for_destination(&dest);
    assert!(!store.part_path().exists());
    assert!(!store.sidecar_path().exists());
}

#[tokio::test]
async fn test_missing_file_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/missing.bin"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (manager, _rx) = manager();
    let job = DownloadJob::new(format!("{}/missing.bin", server.uri()), dir.path().join("missing.bin"))
        .with_config(test_config());
    let result = manager.download(job).await.unwrap();

    assert!(!result.is_success);
    assert_eq!(result.status, JobStatus::Failed);
    let report = result.error.unwrap();
    assert_eq!(report.kind, ErrorKind::HttpError);
    assert!(!report.retryable);
    assert!(!report.suggestions.is_empty());
}

#[tokio::test]
async fn test_complete_destination_is_not_fetched() {
    let server = MockServer::start().await;
    let body = test_body(MB);
    let starts = serve_file(&server, Arc::clone(&body), None).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    std::fs::write(&dest, body.as_slice()).unwrap();

    let (manager, _rx) = manager();
    let job = DownloadJob::new(format!("{}/file.bin", server.uri()), &dest).with_config(test_config());
    let result = manager.download(job).await.unwrap();

    assert!(result.is_success);
    assert_eq!(result.transferred_bytes, 0);
    assert_eq!(result.total_size, MB as u64);
    assert!(starts.lock().is_empty());
}

#[tokio::test]
async fn test_resume_never_refetches_existing_prefix() {
    let server = MockServer::start().await;
    let body = test_body(3 * MB);
    let starts = serve_file(&server, Arc::clone(&body), None).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let store = ResumeStore::for_destination(&dest);
    let existing = 300_000;
    std::fs::write(store.part_path(), &body[..existing]).unwrap();

    let (manager, _rx) = manager();
    let job = DownloadJob::new(format!("{}/file.bin", server.uri()), &dest).with_config(Configuration {
        chunk_size: 512 * 1024,
        ..test_config()
    });
    let result = manager.download(job).await.unwrap();

    assert!(result.is_success, "{:?}", result.error_message);
    assert_eq!(result.transferred_bytes, (body.len() - existing) as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), *body);
    let starts = starts.lock();
    assert!(!starts.is_empty());
    assert!(starts.iter().all(|&start| start >= existing as u64), "{:?}", starts);
}

#[tokio::test]
async fn test_changed_etag_discards_partial() {
    let server = MockServer::start().await;
    let body = test_body(MB);
    let starts = serve_file(&server, Arc::clone(&body), Some("\"new\"")).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let store = ResumeStore::for_destination(&dest);
    std::fs::write(store.part_path(), vec![0xAA; 300_000]).unwrap();
    store
        .save(&ResumeMetadata {
            url: format!("{}/file.bin", server.uri()),
            total_size: Some(MB as u64),
            etag: Some("\"old\"".to_string()),
            last_modified: None,
            completed_bytes: 300_000,
            updated_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let (manager, _rx) = manager();
    let job = DownloadJob::new(format!("{}/file.bin", server.uri()), &dest).with_config(test_config());
    let result = manager.download(job).await.unwrap();

    assert!(result.is_success, "{:?}", result.error_message);
    assert_eq!(result.transferred_bytes, MB as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), *body);
    assert!(starts.lock().contains(&0));
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    let body = test_body(MB);
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    serve_file(&server, Arc::clone(&body), None).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let (manager, mut rx) = manager();
    let job = DownloadJob::new(format!("{}/file.bin", server.uri()), &dest).with_config(Configuration {
        thread_count: 1,
        ..test_config()
    });
    let result = manager.download(job).await.unwrap();

    assert!(result.is_success, "{:?}", result.error_message);
    assert_eq!(std::fs::read(&dest).unwrap(), *body);

    let retries: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::ChunkRetry { kind, attempt, .. } => Some((kind, attempt)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(ErrorKind::ServerError, 1)]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("Content-Length", "1048576"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let (manager, mut rx) = manager();
    let job = DownloadJob::new(format!("{}/file.bin", server.uri()), &dest).with_config(Configuration {
        thread_count: 1,
        max_retries: 1,
        ..test_config()
    });
    let result = manager.download(job).await.unwrap();

    assert!(!result.is_success);
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::ServerError);
    assert!(!dest.exists());

    let terminal = drain(&mut rx).into_iter().rev().find_map(|event| match event {
        EngineEvent::JobStatusChanged { status, error, .. } => Some((status, error)),
        _ => None,
    });
    let (status, error) = terminal.unwrap();
    assert_eq!(status, JobStatus::Failed);
    assert!(error.is_some());
}

#[tokio::test]
async fn test_speed_limit_bounds_throughput() {
    let server = MockServer::start().await;
    let body = test_body(MB);
    serve_file(&server, Arc::clone(&body), None).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let (manager, _rx) = manager();
    let job = DownloadJob::new(format!("{}/file.bin", server.uri()), &dest).with_config(Configuration {
        speed_limit: 256 * 1024,
        ..test_config()
    });
    let result = manager.download(job).await.unwrap();

    assert!(result.is_success, "{:?}", result.error_message);
    // Four one-second windows of 256 KiB
    assert!(result.duration >= Duration::from_millis(2_900), "{:?}", result.duration);
    assert_eq!(std::fs::read(&dest).unwrap(), *body);
}

#[tokio::test]
async fn test_cancel_then_resume_is_byte_identical() {
    let server = MockServer::start().await;
    let body = test_body(2 * MB);
    let starts = serve_file(&server, Arc::clone(&body), Some("\"v1\"")).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let url = format!("{}/file.bin", server.uri());
    let (manager, _rx) = manager();

    let slow = Configuration {
        thread_count: 1,
        speed_limit: 512 * 1024,
        ..test_config()
    };
    let handle = manager
        .submit(DownloadJob::new(&url, &dest).with_config(slow))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    handle.cancel();
    let first = handle.wait().await;

    assert_eq!(first.status, JobStatus::Cancelled);
    assert!(!first.is_success);
    assert!(first.error_message.is_none());
    assert!(!dest.exists());
    let store = ResumeStore::for_destination(&dest);
    let saved = store.load_metadata().await.unwrap().unwrap();
    assert!(saved.completed_bytes > 0);
    assert!(saved.completed_bytes < body.len() as u64);

    starts.lock().clear();
    let second = manager
        .download(DownloadJob::new(&url, &dest).with_config(test_config()))
        .await
        .unwrap();

    assert!(second.is_success, "{:?}", second.error_message);
    assert_eq!(
        second.transferred_bytes,
        body.len() as u64 - saved.completed_bytes
    );
    assert_eq!(std::fs::read(&dest).unwrap(), *body);
    assert!(starts
        .lock()
        .iter()
        .all(|&start| start >= saved.completed_bytes));
}

#[tokio::test]
async fn test_cancelled_run_without_resume_leaves_nothing_to_trust() {
    let server = MockServer::start().await;
    let body = test_body(2 * MB);
    serve_file(&server, Arc::clone(&body), Some("\"v1\"")).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let url = format!("{}/file.bin", server.uri());
    let (manager, _rx) = manager();

    let no_resume = Configuration {
        thread_count: 1,
        speed_limit: 256 * 1024,
        enable_resume_support: false,
        ..test_config()
    };
    let handle = manager
        .submit(DownloadJob::new(&url, &dest).with_config(no_resume))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    handle.cancel();
    let first = handle.wait().await;

    assert_eq!(first.status, JobStatus::Cancelled);
    let store = ResumeStore::for_destination(&dest);
    assert!(!store.part_path().exists());
    assert!(!store.sidecar_path().exists());

    let second = manager
        .download(DownloadJob::new(&url, &dest).with_config(test_config()))
        .await
        .unwrap();

    assert!(second.is_success, "{:?}", second.error_message);
    assert_eq!(second.transferred_bytes, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), *body);
}

#[tokio::test]
async fn test_full_length_part_without_metadata_is_refetched() {
    let server = MockServer::start().await;
    let body = test_body(MB);
    serve_file(&server, Arc::clone(&body), Some("\"v1\"")).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("file.bin");
    let url = format!("{}/file.bin", server.uri());
    // Preallocated and zero-filled, with no sidecar
    let store = ResumeStore::for_destination(&dest);
    std::fs::write(store.part_path(), vec![0u8; body.len()]).unwrap();

    let (manager, _rx) = manager();
    let result = manager
        .download(DownloadJob::new(&url, &dest).with_config(test_config()))
        .await
        .unwrap();

    assert!(result.is_success, "{:?}", result.error_message);
    assert_eq!(result.transferred_bytes, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), *body);
}

#[tokio::test]
async fn test_unsupported_scheme_rejected_before_network() {
    let (manager, _rx) = manager();
    let dir = TempDir::new().unwrap();
    let err = manager
        .submit(DownloadJob::new("ftp://mirror.test/file.bin", dir.path().join("file.bin")))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
