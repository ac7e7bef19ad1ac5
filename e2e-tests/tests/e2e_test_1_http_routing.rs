// E2E Test 1: HTTP routing happy path and no-route behavior.

mod e2e;

use e2e::helpers::{hello_backend, spawn_backend, start_proxy};
use reqwest::header::HOST;

#[tokio::test]
async fn test_e2e_1_happy_http_routing() {
    let backend = spawn_backend(hello_backend()).await;
    let proxy = start_proxy(move |builder| {
        builder.route(format!(
            r#"http && host.contains("localhost") => "http://127.0.0.1:{}""#,
            backend.port()
        ))
    })
    .await;

    println!("requesting {}", proxy.http_url("/"));
    let response = reqwest::get(proxy.http_url("/")).await.expect("request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "hello world");

    proxy.stop().await;
}

#[tokio::test]
async fn test_e2e_1_unknown_host_is_bad_gateway() {
    let backend = spawn_backend(hello_backend()).await;
    let proxy = start_proxy(move |builder| {
        builder.route(format!(
            r#"http && host.contains("localhost") => "http://127.0.0.1:{}""#,
            backend.port()
        ))
    })
    .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/", proxy.http_addr.port()))
        .header(HOST, "unknown.example")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 502);
    assert!(response.bytes().await.expect("body").is_empty());

    proxy.stop().await;
}
