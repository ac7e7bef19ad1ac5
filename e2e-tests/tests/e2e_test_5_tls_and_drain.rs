// E2E Test 5: TLS termination from a seeded cert cache, and the drain bound.

mod e2e;

use e2e::helpers::{hello_backend, seed_certificate, spawn_backend, start_proxy};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_e2e_5_tls_termination() {
    let backend = spawn_backend(hello_backend()).await;

    let cache = tempfile::tempdir().expect("cache dir");
    let cache_dir = cache.path().join("certs");
    seed_certificate(&cache_dir, "localhost");

    let proxy = start_proxy(move |builder| {
        builder.cert_cache(cache_dir.clone()).route(format!(
            r#"http && host.contains("localhost") => "http://127.0.0.1:{}""#,
            backend.port()
        ))
    })
    .await;

    // self-signed test certificate; trust is not what is under test here
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .expect("client");
    let response = client
        .get(proxy.tls_url("/"))
        .send()
        .await
        .expect("https request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "hello world");

    proxy.stop().await;
}

#[tokio::test]
async fn test_e2e_5_drain_finishes_within_bound() {
    let backend = spawn_backend(hello_backend()).await;
    let proxy = start_proxy(move |builder| {
        builder.route(format!(
            r#"http && host.contains("localhost") => "http://127.0.0.1:{}""#,
            backend.port()
        ))
    })
    .await;

    // leave a keep-alive connection open so the drain has work to do
    let client = reqwest::Client::new();
    let response = client
        .get(proxy.http_url("/"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);

    let started = Instant::now();
    proxy.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(15),
        "drain took {:?}",
        started.elapsed()
    );
}
