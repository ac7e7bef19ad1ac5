//! Proxy lifecycle orchestration.
//!
//! `serve` binds the two raw listeners, starts the demux loops and the four
//! logical servers (plaintext HTTP, TLS HTTP, plaintext gRPC, TLS gRPC),
//! then blocks until the supplied cancellation future or a termination
//! signal fires. Shutdown drains each server with a 5 second deadline and
//! bounds the whole stop at 15 seconds.

use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::acme::CertManager;
use crate::config::ProxyConfig;
use crate::demux::{self, virtual_listener, VirtualListener};
use crate::error::{ProxyError, Result};
use crate::grpc;
use crate::http::{self, build_client, HttpClient, HttpState};
use crate::router::Router as ProxyRouter;
use crate::rule::Rule;
use crate::tls;

/// Wall-clock bound on the whole shutdown.
pub(crate) const SHUTDOWN_TOTAL: Duration = Duration::from_secs(15);
/// Per-server graceful drain deadline.
pub(crate) const SHUTDOWN_PER_SERVER: Duration = Duration::from_secs(5);

const VIRTUAL_LISTENER_BACKLOG: usize = 1024;

/// Broadcast cancellation shared by every long-running task.
#[derive(Clone)]
pub(crate) struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub(crate) fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Lifecycle states of a [`Proxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyState {
    New = 0,
    Serving = 1,
    Draining = 2,
    Terminated = 3,
}

/// A secure (ACME) HTTP and gRPC reverse proxy.
#[derive(Debug)]
pub struct Proxy {
    config: ProxyConfig,
    router: Arc<ProxyRouter>,
    certs: Arc<CertManager>,
    client: HttpClient,
    state: AtomicU8,
    addr_tx: watch::Sender<Option<(SocketAddr, SocketAddr)>>,
}

impl Proxy {
    /// Create a proxy from a validated configuration.
    ///
    /// Fails when any routing expression does not compile or the certificate
    /// cache cannot be created.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let rules = compile_rules(&config.routes)?;
        let router = Arc::new(ProxyRouter::new(rules));
        let certs = Arc::new(CertManager::new(
            config.host_policy.clone(),
            config.cert_cache.clone(),
            config.acme_contact.clone(),
            config.acme_directory.clone(),
        )?);
        let client = build_client()?;
        let (addr_tx, _) = watch::channel(None);
        Ok(Self {
            config,
            router,
            certs,
            client,
            state: AtomicU8::new(ProxyState::New as u8),
            addr_tx,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProxyState {
        match self.state.load(Ordering::SeqCst) {
            0 => ProxyState::New,
            1 => ProxyState::Serving,
            2 => ProxyState::Draining,
            _ => ProxyState::Terminated,
        }
    }

    /// The bound listener addresses, available once `serve` has bound both
    /// sockets. Useful when binding port 0.
    pub async fn listen_addrs(&self) -> (SocketAddr, SocketAddr) {
        let mut rx = self.addr_tx.subscribe();
        loop {
            if let Some(addrs) = *rx.borrow_and_update() {
                return addrs;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Replace the routing table.
    ///
    /// All expressions are compiled first; on the first compile error the
    /// active table is left unchanged. Safe to call while serving.
    pub fn override_triggers(&self, expressions: &[String]) -> Result<()> {
        let rules = compile_rules(expressions)?;
        let count = rules.len();
        self.router.replace(rules);
        info!(routes = count, "Routing table replaced");
        Ok(())
    }

    /// Serve until the cancellation future resolves or a termination signal
    /// (SIGINT/SIGTERM) arrives, then drain and return.
    pub async fn serve<F>(&self, cancel: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if !self.transition(ProxyState::New, ProxyState::Serving) {
            return Err(ProxyError::Config(
                "serve may only be called once".to_string(),
            ));
        }
        let _ = rustls::crypto::ring::default_provider().install_default();

        let insecure = TcpListener::bind(("0.0.0.0", self.config.insecure_port))
            .await
            .map_err(|e| {
                self.set_state(ProxyState::Terminated);
                ProxyError::Listen(e)
            })?;
        let secure = match TcpListener::bind(("0.0.0.0", self.config.secure_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                drop(insecure);
                self.set_state(ProxyState::Terminated);
                return Err(ProxyError::Listen(e));
            }
        };
        let insecure_addr = insecure.local_addr().map_err(ProxyError::Listen)?;
        let secure_addr = secure.local_addr().map_err(ProxyError::Listen)?;
        self.addr_tx.send_replace(Some((insecure_addr, secure_addr)));
        info!(
            insecure = %insecure_addr,
            secure = %secure_addr,
            routes = self.router.table().len(),
            redirect_https = self.config.redirect_https,
            "Proxy serving"
        );

        let acceptor = match tls::build_acceptor(&self.certs) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                self.set_state(ProxyState::Terminated);
                return Err(e);
            }
        };
        let shutdown = Shutdown::new();

        let state = HttpState {
            router: self.router.clone(),
            client: self.client.clone(),
            challenges: self.certs.challenges(),
        };
        let mut plain_middlewares = self.config.middlewares.clone();
        plain_middlewares.extend(self.config.http_init.iter().cloned());
        let plain_app = http::build_router(
            state.clone(),
            &plain_middlewares,
            self.config.redirect_https,
        );
        let mut tls_middlewares = self.config.middlewares.clone();
        tls_middlewares.extend(self.config.https_init.iter().cloned());
        let tls_app = http::build_router(state, &tls_middlewares, false);

        let (http_tx_i, http_rx_i) = virtual_listener(VIRTUAL_LISTENER_BACKLOG);
        let (grpc_tx_i, grpc_rx_i) = virtual_listener(VIRTUAL_LISTENER_BACKLOG);
        let (http_tx_s, http_rx_s) = virtual_listener(VIRTUAL_LISTENER_BACKLOG);
        let (grpc_tx_s, grpc_rx_s) = virtual_listener(VIRTUAL_LISTENER_BACKLOG);

        let mut tasks = JoinSet::new();
        tasks.spawn(demux::demux_loop(
            insecure,
            None,
            http_tx_i,
            grpc_tx_i,
            shutdown.clone(),
            "insecure",
        ));
        tasks.spawn(demux::demux_loop(
            secure,
            Some(acceptor),
            http_tx_s,
            grpc_tx_s,
            shutdown.clone(),
            "secure",
        ));
        tasks.spawn(http_server(http_rx_i, plain_app, shutdown.clone(), "http"));
        tasks.spawn(http_server(http_rx_s, tls_app, shutdown.clone(), "https"));
        tasks.spawn(grpc::serve(
            grpc_rx_i,
            self.router.clone(),
            self.config.grpc_init.clone(),
            shutdown.clone(),
            "grpc",
        ));
        tasks.spawn(grpc::serve(
            grpc_rx_s,
            self.router.clone(),
            self.config.grpcs_init.clone(),
            shutdown.clone(),
            "grpcs",
        ));

        let renewal = self.certs.spawn_renewal();

        tokio::select! {
            _ = cancel => debug!("Cancellation requested"),
            _ = termination_signal() => debug!("Termination signal received"),
        }

        self.set_state(ProxyState::Draining);
        shutdown.trigger();

        let drained = tokio::time::timeout(SHUTDOWN_TOTAL, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown deadline elapsed, aborting remaining servers");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        renewal.abort();

        self.set_state(ProxyState::Terminated);
        info!("Proxy stopped");
        Ok(())
    }

    fn transition(&self, from: ProxyState, to: ProxyState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set_state(&self, to: ProxyState) {
        self.state.store(to as u8, Ordering::SeqCst);
    }
}

fn compile_rules(sources: &[String]) -> Result<Vec<Rule>> {
    sources.iter().map(|source| Rule::new(source)).collect()
}

/// One logical HTTP server over a virtual listener.
async fn http_server(
    mut listener: VirtualListener,
    app: axum::Router,
    shutdown: Shutdown,
    label: &'static str,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Some(io) => {
                    let app = app.clone();
                    let service = hyper::service::service_fn(
                        move |request: axum::http::Request<Incoming>| app.clone().oneshot(request),
                    );
                    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
                    let connection = graceful.watch(connection.into_owned());
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            debug!(server = label, error = %e, "Connection ended with error");
                        }
                    });
                }
                None => break,
            }
        }
    }
    tokio::select! {
        _ = graceful.shutdown() => debug!(server = label, "HTTP server drained"),
        _ = tokio::time::sleep(SHUTDOWN_PER_SERVER) => {
            warn!(server = label, "Drain deadline elapsed, dropping remaining connections");
        }
    }
    debug!(server = label, "HTTP server stopped");
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                loop {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
