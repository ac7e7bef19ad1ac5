//! ingress-rs: expression-routed HTTP & gRPC reverse proxy
//!
//! Thin binary around the library: loads the TOML configuration, wires CORS
//! middleware, optionally watches the config file to hot-reload the routing
//! table, and serves until interrupted.

use axum::http::{HeaderName, HeaderValue, Method};
use ingress_rs::config::CorsSection;
use ingress_rs::{FileConfig, Proxy};
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "ingress.toml".to_string()),
    );
    let file_config = FileConfig::from_file(&config_path)?;

    let default_filter = if file_config.debug {
        "ingress_rs=debug,tower_http=debug"
    } else {
        "ingress_rs=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ingress-rs v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %config_path.display(), routes = file_config.routing.len(), "Configuration loaded");

    let mut builder = file_config.to_builder()?;
    if let Some(cors) = &file_config.cors {
        let layer = build_cors_layer(cors)?;
        builder = builder.middleware(move |router| router.layer(layer.clone()));
    }

    let proxy = Arc::new(Proxy::new(builder.build()?)?);

    let _watcher = if file_config.watch {
        Some(spawn_config_watcher(&config_path, proxy.clone())?)
    } else {
        None
    };

    proxy.serve(std::future::pending()).await?;
    Ok(())
}

/// Re-apply the routing table whenever the config file changes.
///
/// A malformed edit is logged and leaves the running table untouched.
fn spawn_config_watcher(
    config_path: &Path,
    proxy: Arc<Proxy>,
) -> anyhow::Result<notify::RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if event.is_ok() {
            let _ = tx.blocking_send(());
        }
    })?;
    watcher.watch(config_path, RecursiveMode::NonRecursive)?;
    info!(config = %config_path.display(), "Watching configuration for route changes");

    let config_path = config_path.to_path_buf();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match FileConfig::from_file(&config_path) {
                Ok(config) => match proxy.override_triggers(&config.routing) {
                    Ok(()) => info!(routes = config.routing.len(), "Routing table reloaded"),
                    Err(e) => error!(error = %e, "Route reload failed, keeping active table"),
                },
                Err(e) => error!(error = %e, "Config reload failed, keeping active table"),
            }
        }
    });
    Ok(watcher)
}

fn build_cors_layer(cors: &CorsSection) -> anyhow::Result<CorsLayer> {
    let mut layer = CorsLayer::new();

    if cors.origins.iter().any(|o| o == "*") {
        layer = layer.allow_origin(Any);
    } else if !cors.origins.is_empty() {
        let origins = cors
            .origins
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()?;
        layer = layer.allow_origin(AllowOrigin::list(origins));
    }

    if cors.methods.iter().any(|m| m == "*") {
        layer = layer.allow_methods(Any);
    } else if !cors.methods.is_empty() {
        let methods = cors
            .methods
            .iter()
            .map(|m| m.parse::<Method>())
            .collect::<Result<Vec<_>, _>>()?;
        layer = layer.allow_methods(AllowMethods::list(methods));
    }

    if cors.headers.iter().any(|h| h == "*") {
        layer = layer.allow_headers(Any);
    } else if !cors.headers.is_empty() {
        let headers = cors
            .headers
            .iter()
            .map(|h| h.parse::<HeaderName>())
            .collect::<Result<Vec<_>, _>>()?;
        layer = layer.allow_headers(AllowHeaders::list(headers));
    }

    Ok(layer)
}
