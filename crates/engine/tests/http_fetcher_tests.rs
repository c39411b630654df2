//! The reqwest fetcher against a local mock server.

mod common;

use common::{TestAsset, TestEnv, get_update, manifest_body, remote_manifest, seeded_bytes};
use httpmock::Method::GET;
use httpmock::MockServer;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use updraft_core::UpdateStatus;
use updraft_engine::loader::headers;
use updraft_engine::{HttpFetcher, LoadError, ProgressFn, ReqwestFetcher, UpdateEngine};

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

#[tokio::test]
async fn test_fetch_returns_status_headers_and_body() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/manifest")
                .header("updraft-runtime-version", "1.0.0");
            then.status(200)
                .header("Updraft-Signature", "sig=\"abc\"")
                .body("hello world");
        })
        .await;

    let fetcher = ReqwestFetcher::new().unwrap();
    let received = AtomicU64::new(0);
    let progress = |bytes: u64, _total: Option<u64>| received.store(bytes, Ordering::SeqCst);
    let request_headers = vec![(
        headers::RUNTIME_VERSION.to_string(),
        "1.0.0".to_string(),
    )];

    let response = fetcher
        .fetch(
            &server.url("/manifest"),
            &request_headers,
            Some(64),
            Some(&progress as &ProgressFn<'_>),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header(headers::SIGNATURE), Some("sig=\"abc\""));
    assert_eq!(response.body.as_ref(), b"hello world");
    assert_eq!(received.load(Ordering::SeqCst), 11);
}

#[tokio::test]
async fn test_fetch_passes_error_status_through() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/manifest");
            then.status(503).body("service unavailable");
        })
        .await;

    let fetcher = ReqwestFetcher::new().unwrap();
    let response = fetcher
        .fetch(&server.url("/manifest"), &[], Some(4), None)
        .await
        .unwrap();
    assert_eq!(response.status, 503);

    let err = response.error_for_status().unwrap_err();
    assert!(matches!(err, LoadError::Http { status: 503 }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_fetch_stops_when_body_exceeds_cap() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/asset");
            then.status(200).body(seeded_bytes(32, 64 * 1024).to_vec());
        })
        .await;

    let fetcher = ReqwestFetcher::new().unwrap();
    let err = fetcher
        .fetch(&server.url("/asset"), &[], Some(1024), None)
        .await
        .unwrap_err();
    match err {
        LoadError::SizeMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1024);
            assert!(actual > 1024);
        }
        other => panic!("expected SizeMismatch, got {other:?}"),
    }

    let response = fetcher
        .fetch(&server.url("/asset"), &[], Some(64 * 1024), None)
        .await
        .unwrap();
    assert_eq!(response.body.len(), 64 * 1024);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let fetcher = ReqwestFetcher::new().unwrap();
    let err = fetcher
        .fetch(&format!("http://127.0.0.1:{port}/manifest"), &[], None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Network(_)));
    assert!(err.is_network());
}

#[tokio::test]
async fn test_engine_loads_update_over_http() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let assets = vec![
        TestAsset::new("main.bundle", seeded_bytes(30, 2048)),
        TestAsset::new("img/logo.png", seeded_bytes(31, 128)),
    ];
    let mut manifest = remote_manifest(100, &assets);
    // Relative URLs resolve against the manifest endpoint.
    for entry in &mut manifest.assets {
        entry.url = Some(format!("/static/{}", entry.key));
    }

    let manifest_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/manifest")
                .header("updraft-runtime-version", "1.0.0");
            then.status(200)
                .header("content-type", "application/json")
                .body(manifest_body(&manifest));
        })
        .await;
    let mut asset_mocks = Vec::new();
    for asset in &assets {
        let content = asset.content.to_vec();
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/static/{}", asset.key));
                then.status(200).body(content);
            })
            .await;
        asset_mocks.push(mock);
    }

    let mut env = TestEnv::new();
    env.config.update_url = Some(server.url("/api/manifest"));
    let engine = UpdateEngine::open(env.config.clone()).await.unwrap();

    let loaded = engine.check_for_update().await.unwrap();
    assert_eq!(loaded, Some(manifest.id));
    assert_eq!(get_update(&engine, manifest.id).await.status, UpdateStatus::Ready);

    manifest_mock.assert_async().await;
    for mock in &asset_mocks {
        mock.assert_async().await;
    }

    let descriptor = engine.launch().await.unwrap();
    let logo = std::fs::read(&descriptor.asset_paths["img/logo.png"]).unwrap();
    assert_eq!(logo, assets[1].content.as_ref());
}
