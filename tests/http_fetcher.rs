//! HTTP adapter against a scripted origin.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use common::{Reply, ScriptedServer};
use phoenix::config::HttpFetcherConfig;
use phoenix::fetcher::SecretFn;
use phoenix::{Fetcher, HttpFetcher, PhoenixError, UpdateOutcome, Updater};

const BINARY: &[u8] = b"\x7fELF pretend this is a new build";

fn config(url: String, etag: Option<&str>) -> HttpFetcherConfig {
    HttpFetcherConfig {
        url,
        interval_secs: 1,
        initial_header_states: etag.map(|v| HashMap::from([("ETag".to_string(), v.to_string())])),
        ..Default::default()
    }
}

fn fetcher(config: HttpFetcherConfig) -> HttpFetcher {
    let mut fetcher = HttpFetcher::new(config);
    fetcher.init().unwrap();
    fetcher
}

async fn read_all(stream: phoenix::ArtifactStream) -> Vec<u8> {
    let mut stream = stream;
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

/// Produces "t1", "t2", ... one value per call.
fn rotating_secret() -> SecretFn {
    let counter = Arc::new(AtomicUsize::new(0));
    Arc::new(move || format!("t{}", counter.fetch_add(1, Ordering::SeqCst) + 1))
}

// ============================================================================
// Change detection
// ============================================================================

#[tokio::test]
async fn unchanged_etag_skips_download() {
    let server = ScriptedServer::start(vec![Reply::new(200).header("ETag", "\"v1\"")]).await;
    let mut fetcher = fetcher(config(server.url("/app"), Some("\"v1\"")));

    assert!(fetcher.fetch().await.unwrap().is_none());

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "HEAD");
    assert_eq!(requests[0].path, "/app");
    // The stored value is replayed so the origin can answer conditionally.
    assert_eq!(requests[0].header("etag"), Some("\"v1\""));
}

#[tokio::test]
async fn changed_etag_downloads_and_commits() {
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).header("ETag", "\"v2\"").body(BINARY),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app"), Some("\"v1\"")));

    let stream = fetcher.fetch().await.unwrap().expect("new artifact");
    assert_eq!(read_all(stream).await, BINARY);
    assert_eq!(
        fetcher.last_observed().get("ETag").map(String::as_str),
        Some("\"v2\"")
    );

    let methods: Vec<_> = server.requests().into_iter().map(|r| r.method).collect();
    assert_eq!(methods, ["HEAD", "GET"]);
}

#[tokio::test]
async fn no_watched_headers_counts_as_unchanged() {
    let server = ScriptedServer::start(vec![Reply::new(200).header("X-Other", "1")]).await;
    let mut fetcher = fetcher(HttpFetcherConfig {
        check_headers: Some(vec!["X-Version".into()]),
        ..config(server.url("/app"), None)
    });

    assert!(fetcher.fetch().await.unwrap().is_none());
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn first_poll_without_state_downloads() {
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("Last-Modified", "Tue, 01 Oct 2024 00:00:00 GMT"),
        Reply::new(200).body(BINARY),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app"), None));

    let stream = fetcher.fetch().await.unwrap().expect("new artifact");
    assert_eq!(read_all(stream).await, BINARY);
    assert_eq!(
        fetcher.last_observed().get("Last-Modified").map(String::as_str),
        Some("Tue, 01 Oct 2024 00:00:00 GMT")
    );
}

// ============================================================================
// Failures leave state untouched
// ============================================================================

#[tokio::test]
async fn probe_failure_is_an_error_without_download() {
    let server = ScriptedServer::start(vec![Reply::new(404)]).await;
    let mut fetcher = fetcher(config(server.url("/app"), Some("\"v1\"")));

    let err = fetcher.fetch().await.err().expect("probe error");
    assert!(matches!(err, PhoenixError::Probe(_)));
    assert!(err.to_string().contains("404"));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn failed_download_keeps_state_and_retries() {
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(500),
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app"), Some("\"v1\"")));

    let err = fetcher.fetch().await.err().expect("retrieval error");
    assert!(matches!(err, PhoenixError::Retrieval(_)));
    assert_eq!(
        fetcher.last_observed().get("ETag").map(String::as_str),
        Some("\"v1\"")
    );

    // The next poll sees the same change and downloads it.
    let stream = fetcher.fetch().await.unwrap().expect("new artifact");
    assert_eq!(read_all(stream).await, BINARY);
    assert_eq!(
        fetcher.last_observed().get("ETag").map(String::as_str),
        Some("\"v2\"")
    );
    assert_eq!(server.requests().len(), 4);
}

// ============================================================================
// Incomplete and rejected downloads
// ============================================================================

fn truncated_then_complete() -> Vec<Reply> {
    vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).header("Content-Length", "1000").body("short"),
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
    ]
}

#[tokio::test]
async fn truncated_body_keeps_state_and_retries() {
    let server = ScriptedServer::start(truncated_then_complete()).await;
    let mut fetcher = fetcher(config(server.url("/app"), Some("\"v1\"")));

    let mut stream = fetcher.fetch().await.unwrap().expect("new artifact");
    let mut partial = Vec::new();
    assert!(stream.read_to_end(&mut partial).await.is_err());
    drop(stream);
    assert_eq!(
        fetcher.last_observed().get("ETag").map(String::as_str),
        Some("\"v1\"")
    );

    let stream = fetcher.fetch().await.unwrap().expect("retried artifact");
    assert_eq!(read_all(stream).await, BINARY);
    assert_eq!(
        fetcher.last_observed().get("ETag").map(String::as_str),
        Some("\"v2\"")
    );

    let requests = server.requests();
    let methods: Vec<_> = requests.iter().map(|r| r.method.as_str()).collect();
    assert_eq!(methods, ["HEAD", "GET", "HEAD", "GET"]);
    assert_eq!(requests[2].header("etag"), Some("\"v1\""));
}

#[tokio::test]
async fn abandoned_body_is_downloaded_again() {
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app"), Some("\"v1\"")));

    drop(fetcher.fetch().await.unwrap().expect("new artifact"));
    let stream = fetcher.fetch().await.unwrap().expect("downloaded again");
    assert_eq!(read_all(stream).await, BINARY);
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn rejected_artifact_is_downloaded_again() {
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app"), Some("\"v1\"")));

    let stream = fetcher.fetch().await.unwrap().expect("new artifact");
    assert_eq!(read_all(stream).await, BINARY);
    fetcher.reject();
    assert_eq!(
        fetcher.last_observed().get("ETag").map(String::as_str),
        Some("\"v1\"")
    );

    assert!(fetcher.fetch().await.unwrap().is_some());
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn updater_installs_after_truncated_download() {
    let server = ScriptedServer::start(truncated_then_complete()).await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("app");
    std::fs::write(&target, b"v1").unwrap();

    let mut updater = Updater::new(
        Box::new(fetcher(config(server.url("/app"), Some("\"v1\"")))),
        &target,
    );

    let err = updater.check_once().await.unwrap_err();
    assert!(matches!(err, PhoenixError::Retrieval(_)));
    assert!(err.is_retryable());
    assert_eq!(std::fs::read(&target).unwrap(), b"v1");

    let outcome = updater.check_once().await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Installed { bytes, .. } if bytes == BINARY.len() as u64));
    assert_eq!(std::fs::read(&target).unwrap(), BINARY);
}

// ============================================================================
// Retrieval modes and auth
// ============================================================================

#[tokio::test]
async fn fresh_retrieval_sends_only_auth() {
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
    ])
    .await;
    let mut fetcher = HttpFetcher::new(config(server.url("/app"), Some("\"v1\"")))
        .with_auth("X-Token", rotating_secret());
    fetcher.init().unwrap();

    fetcher.fetch().await.unwrap().expect("new artifact");

    let requests = server.requests();
    assert_eq!(requests[0].header("x-token"), Some("t1"));
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].header("x-token"), Some("t2"));
    assert_eq!(requests[1].header("etag"), None);
}

#[tokio::test]
async fn reused_retrieval_repeats_probe_headers() {
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(BINARY),
    ])
    .await;
    let mut fetcher = HttpFetcher::new(HttpFetcherConfig {
        send_headers_in_get: true,
        ..config(server.url("/app"), Some("\"v1\""))
    })
    .with_auth("X-Token", rotating_secret());
    fetcher.init().unwrap();

    fetcher.fetch().await.unwrap().expect("new artifact");

    let requests = server.requests();
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].header("x-token"), Some("t1"));
    assert_eq!(requests[1].header("etag"), Some("\"v1\""));
}

// ============================================================================
// Decompression
// ============================================================================

async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = async_compression::tokio::bufread::GzipEncoder::new(data);
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn gz_suffix_is_decompressed() {
    let compressed = gzip(BINARY).await;
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(compressed),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app.gz"), None));

    let stream = fetcher.fetch().await.unwrap().expect("new artifact");
    assert_eq!(read_all(stream).await, BINARY);
}

#[tokio::test]
async fn transport_encoding_is_not_decompressed_twice() {
    let compressed = gzip(BINARY).await;
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200)
            .header("Content-Encoding", "gzip")
            .body(compressed.clone()),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app.gz"), None));

    let stream = fetcher.fetch().await.unwrap().expect("new artifact");
    assert_eq!(read_all(stream).await, compressed);
}

#[tokio::test]
async fn plain_suffix_is_not_decompressed() {
    let compressed = gzip(BINARY).await;
    let server = ScriptedServer::start(vec![
        Reply::new(200).header("ETag", "\"v2\""),
        Reply::new(200).body(compressed.clone()),
    ])
    .await;
    let mut fetcher = fetcher(config(server.url("/app"), None));

    let stream = fetcher.fetch().await.unwrap().expect("new artifact");
    assert_eq!(read_all(stream).await, compressed);
}
