//! Integration tests for mirror fallback, redirects and the size gate
//!
//! These tests verify that:
//! - A failing primary mirror falls through to the next candidate
//! - Redirect chains are followed and counted
//! - Undersized bodies are rejected and never left on disk
//! - The provisioner downloads, extracts and verifies a served archive
//!
//! Fixtures are served by an in-process axum server on 127.0.0.1:0.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;

use deskpack::config::DownloadConfig;
use deskpack::events::{EngineEvent, EventSink};
use deskpack::provision::{DownloadError, DownloadTask, Downloader};

const MIB: u64 = 1024 * 1024;

// ─── Fixture Server ───────────────────────────────────────────────────────────

struct Fixture {
    base: String,
    hits: Arc<AtomicUsize>,
}

impl Fixture {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

async fn start_fixture(payload: Bytes) -> Fixture {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let body = payload;

    let router = Router::new()
        .route("/a/php.zip", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/b/php.zip",
            get(|| async { Redirect::temporary("/c/php.zip") }),
        )
        .route(
            "/found/php.zip",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/b/php.zip")]) }),
        )
        .route(
            "/c/php.zip",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                async move { body }
            }),
        )
        .route(
            "/tiny/php.zip",
            get(|| async { "<html><body>Not here</body></html>" }),
        )
        .route(
            "/loop/php.zip",
            get(|| async { Redirect::temporary("/loop/php.zip").into_response() }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Fixture {
        base: format!("http://{}", addr),
        hits,
    }
}

fn downloader(max_redirects: Option<usize>) -> Downloader {
    Downloader::new(&DownloadConfig {
        max_redirects,
        ..DownloadConfig::default()
    })
    .unwrap()
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ─── Downloader ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fallback_through_redirect_to_large_archive() {
    let size = 40 * 1_000_000;
    let fixture = start_fixture(Bytes::from(vec![0x50u8; size])).await;
    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("cache").join("php.zip");

    let task = DownloadTask {
        candidates: vec![fixture.url("/a/php.zip"), fixture.url("/b/php.zip")],
        destination: destination.clone(),
        min_size_bytes: 5 * MIB,
    };
    let (events, mut rx) = EventSink::channel();
    let report = downloader(None).fetch(&task, &events).await.unwrap();

    assert_eq!(report.candidate_index, 1);
    assert_eq!(report.redirects, 1);
    assert_eq!(report.bytes, size as u64);
    assert_eq!(report.final_url, fixture.url("/c/php.zip"));
    assert_eq!(
        std::fs::metadata(&destination).unwrap().len(),
        size as u64
    );

    let events = drain(&mut rx);
    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Status { status, .. } => Some(status.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec!["Connecting to primary server...", "Trying fallback mirror..."]
    );

    let last_progress = events
        .iter()
        .rev()
        .find_map(|e| match e {
            EngineEvent::DownloadProgress { current, total, percent, .. } => {
                Some((*current, *total, *percent))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(last_progress.0, size as u64);
    assert_eq!(last_progress.1, size as u64);
    assert!((last_progress.2 - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_redirect_chain_matches_direct_download() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let fixture = start_fixture(Bytes::from(payload.clone())).await;
    let temp = TempDir::new().unwrap();

    let fetch = |url: String, name: &str| DownloadTask {
        candidates: vec![url],
        destination: temp.path().join(name),
        min_size_bytes: 1024,
    };
    let client = downloader(None);

    let direct = fetch(fixture.url("/c/php.zip"), "direct.zip");
    let chained = fetch(fixture.url("/found/php.zip"), "chained.zip");
    let direct_report = client.fetch(&direct, &EventSink::disabled()).await.unwrap();
    let chained_report = client.fetch(&chained, &EventSink::disabled()).await.unwrap();

    assert_eq!(direct_report.redirects, 0);
    assert_eq!(chained_report.redirects, 2);
    assert_eq!(
        std::fs::read(&direct.destination).unwrap(),
        std::fs::read(&chained.destination).unwrap()
    );
    assert_eq!(std::fs::read(&chained.destination).unwrap(), payload);
}

#[tokio::test]
async fn test_all_mirrors_undersized_leaves_no_file() {
    let fixture = start_fixture(Bytes::from_static(b"short")).await;
    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("php.zip");

    let task = DownloadTask {
        candidates: vec![fixture.url("/tiny/php.zip"), fixture.url("/c/php.zip")],
        destination: destination.clone(),
        min_size_bytes: 5 * MIB,
    };
    let err = downloader(None)
        .fetch(&task, &EventSink::disabled())
        .await
        .unwrap_err();

    assert!(err.is_integrity());
    assert!(matches!(err, DownloadError::Exhausted { attempts: 2, .. }));
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_status_error_reports_url() {
    let fixture = start_fixture(Bytes::from_static(b"unused")).await;
    let temp = TempDir::new().unwrap();

    let task = DownloadTask {
        candidates: vec![fixture.url("/a/php.zip")],
        destination: temp.path().join("php.zip"),
        min_size_bytes: 1,
    };
    let err = downloader(None)
        .fetch(&task, &EventSink::disabled())
        .await
        .unwrap_err();

    let DownloadError::Exhausted { last, .. } = err else {
        panic!("expected exhausted error");
    };
    match *last {
        DownloadError::Status { url, status } => {
            assert_eq!(status, 404);
            assert_eq!(url, fixture.url("/a/php.zip"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_redirect_cap_breaks_loops() {
    let fixture = start_fixture(Bytes::from_static(b"unused")).await;
    let temp = TempDir::new().unwrap();

    let task = DownloadTask {
        candidates: vec![fixture.url("/loop/php.zip")],
        destination: temp.path().join("php.zip"),
        min_size_bytes: 1,
    };
    let err = downloader(Some(5))
        .fetch(&task, &EventSink::disabled())
        .await
        .unwrap_err();

    let DownloadError::Exhausted { last, .. } = err else {
        panic!("expected exhausted error");
    };
    assert!(matches!(*last, DownloadError::TooManyRedirects { limit: 5, .. }));
    assert!(!task.destination.exists());
}

// ─── Provisioner ──────────────────────────────────────────────────────────────

#[cfg(unix)]
fn fake_php_zip() -> Bytes {
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().unix_permissions(0o755);
    zip.start_file("php-8.3.12/php", options).unwrap();
    zip.write_all(b"#!/bin/sh\necho 'PHP 8.3.12 (cli) (NTS)'\n")
        .unwrap();
    zip.start_file("php-8.3.12/ext/php_curl.dll", options)
        .unwrap();
    zip.write_all(&[0u8; 4096]).unwrap();
    Bytes::from(zip.finish().unwrap().into_inner())
}

#[cfg(unix)]
#[tokio::test]
async fn test_provision_downloads_then_reuses_cache() {
    use deskpack::fsops::{FsMutator, RetryPolicy};
    use deskpack::provision::RuntimeProvisioner;
    use std::collections::BTreeMap;

    let fixture = start_fixture(fake_php_zip()).await;
    let temp = TempDir::new().unwrap();

    let mut releases = BTreeMap::new();
    releases.insert("8.3".to_string(), "php.zip".to_string());
    let config = DownloadConfig {
        mirrors: vec![
            format!("{}/a/{{file}}", fixture.base),
            format!("{}/c/{{file}}", fixture.base),
        ],
        releases,
        min_size_bytes: 1024,
        ..DownloadConfig::default()
    };
    let provisioner = RuntimeProvisioner::new(
        temp.path().join("cache"),
        config,
        FsMutator::new(RetryPolicy::default()),
    )
    .unwrap();

    let runtime = provisioner
        .provision("8.3", &EventSink::disabled())
        .await
        .unwrap();
    assert_eq!(runtime.banner, "PHP 8.3.12 (cli) (NTS)");
    assert_eq!(
        runtime.binary_dir,
        temp.path().join("cache").join("php-8.3").join("php-8.3.12")
    );
    assert_eq!(fixture.hits.load(Ordering::SeqCst), 1);

    // Second run is served from the cached archive
    provisioner
        .provision("8.3", &EventSink::disabled())
        .await
        .unwrap();
    assert_eq!(fixture.hits.load(Ordering::SeqCst), 1);
}
