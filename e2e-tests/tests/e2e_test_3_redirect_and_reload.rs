// E2E Test 3: HTTPS redirect mode and routing hot-reload.

mod e2e;

use e2e::helpers::{hello_backend, spawn_backend, start_proxy};
use reqwest::header::{HOST, LOCATION};
use reqwest::redirect::Policy;

#[tokio::test]
async fn test_e2e_3_redirect_mode() {
    let backend = spawn_backend(hello_backend()).await;
    let proxy = start_proxy(move |builder| {
        builder
            .redirect_https(true)
            .route(format!(r#"http => "http://127.0.0.1:{}""#, backend.port()))
    })
    .await;

    let client = reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("client");
    let response = client
        .get(proxy.http_url("/p?q=1"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 301);
    assert_eq!(
        response.headers().get(LOCATION).expect("location header"),
        "https://localhost/p?q=1"
    );

    proxy.stop().await;
}

#[tokio::test]
async fn test_e2e_3_hot_reload() {
    let backend_a = spawn_backend(hello_backend()).await;
    let backend_b = spawn_backend(
        axum::Router::new().fallback(|| async { "backend b" }),
    )
    .await;

    let proxy = start_proxy(move |builder| {
        builder.route(format!(
            r#"http && host == "a.test" => "http://127.0.0.1:{}""#,
            backend_a.port()
        ))
    })
    .await;

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}/", proxy.http_addr.port());

    let response = client
        .get(&base)
        .header(HOST, "a.test")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);

    // swap the table: only b.test routes now
    proxy
        .proxy
        .override_triggers(&[format!(
            r#"http && host == "b.test" => "http://127.0.0.1:{}""#,
            backend_b.port()
        )])
        .expect("reload");

    let response = client
        .get(&base)
        .header(HOST, "a.test")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 502);

    let response = client
        .get(&base)
        .header(HOST, "b.test")
        .send()
        .await
        .expect("request");
    assert_eq!(response.text().await.expect("body"), "backend b");

    // a malformed list must leave the active table in place
    let err = proxy
        .proxy
        .override_triggers(&["does not parse (".to_string()]);
    assert!(err.is_err());

    let response = client
        .get(&base)
        .header(HOST, "b.test")
        .send()
        .await
        .expect("request");
    assert_eq!(response.text().await.expect("body"), "backend b");

    proxy.stop().await;
}
