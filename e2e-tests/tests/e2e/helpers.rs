//! Shared helpers: in-process backends and a proxy bound to ephemeral ports.

use axum::{body::Body, http::Request, Router};
use ingress_rs::{HostPolicy, Proxy, ProxyConfig, ProxyConfigBuilder};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A proxy running in the background on ephemeral ports.
pub struct ProxyHandle {
    pub proxy: Arc<Proxy>,
    pub http_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    cancel: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<ingress_rs::Result<()>>,
    _cache: tempfile::TempDir,
}

impl ProxyHandle {
    pub fn http_url(&self, path_and_query: &str) -> String {
        format!("http://localhost:{}{}", self.http_addr.port(), path_and_query)
    }

    pub fn tls_url(&self, path_and_query: &str) -> String {
        format!("https://localhost:{}{}", self.tls_addr.port(), path_and_query)
    }

    /// Cancel the proxy and wait for the drain to finish.
    pub async fn stop(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(20), self.task).await;
    }
}

/// Start a proxy on ephemeral ports. The closure receives a builder with the
/// ports, cert cache and a permissive host policy pre-set, and must add the
/// routes (and any overrides) for the scenario.
pub async fn start_proxy<F>(configure: F) -> ProxyHandle
where
    F: FnOnce(ProxyConfigBuilder) -> ProxyConfigBuilder,
{
    let cache = tempfile::tempdir().expect("temp cert cache");
    let builder = ProxyConfig::builder()
        .insecure_port(0)
        .secure_port(0)
        .cert_cache(cache.path().join("certs"))
        .host_policy(HostPolicy::custom(|_| true));
    let config = configure(builder).build().expect("proxy config");
    let proxy = Arc::new(Proxy::new(config).expect("proxy construction"));

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let serving = proxy.clone();
    let task = tokio::spawn(async move {
        serving
            .serve(async {
                let _ = cancel_rx.await;
            })
            .await
    });
    let (http_addr, tls_addr) = proxy.listen_addrs().await;
    println!("proxy listening: http={http_addr} tls={tls_addr}");

    ProxyHandle {
        proxy,
        http_addr,
        tls_addr,
        cancel: Some(cancel_tx),
        task,
        _cache: cache,
    }
}

/// Bind an axum app on an ephemeral port and serve it in the background.
pub async fn spawn_backend(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("backend bind");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("backend serve");
    });
    addr
}

/// Backend answering every request with `hello world`.
pub fn hello_backend() -> Router {
    Router::new().fallback(|| async { "hello world" })
}

/// Backend echoing the request URI it received.
pub fn echo_uri_backend() -> Router {
    Router::new().fallback(|req: Request<Body>| async move { req.uri().to_string() })
}

/// Backend echoing the User-Agent header it received, bracketed.
pub fn echo_user_agent_backend() -> Router {
    Router::new().fallback(|req: Request<Body>| async move {
        let ua = req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match ua {
            Some(ua) => format!("ua=[{ua}]"),
            None => "ua=absent".to_string(),
        }
    })
}

/// Write a self-signed certificate pair for `domain` into a cert cache
/// directory, in the layout the proxy loads at startup.
pub fn seed_certificate(cache_dir: &Path, domain: &str) {
    std::fs::create_dir_all(cache_dir).expect("cert cache dir");
    let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).expect("self-signed");
    std::fs::write(cache_dir.join(format!("{domain}.crt")), cert.cert.pem())
        .expect("write certificate");
    std::fs::write(
        cache_dir.join(format!("{domain}.key")),
        cert.key_pair.serialize_pem(),
    )
    .expect("write key");
}
