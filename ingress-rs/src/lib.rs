//! ingress-rs: expression-routed HTTP and gRPC reverse proxy with automatic TLS
//!
//! A dual-protocol reverse proxy that terminates TLS for inbound HTTP/1.1 and
//! HTTP/2 (including gRPC) traffic, obtains certificates automatically via
//! ACME (Let's Encrypt), and picks the backend for each request by evaluating
//! user-authored routing expressions against per-request metadata.
//!
//! # Features
//!
//! - One plaintext and one TLS listener, demultiplexed into four logical
//!   servers (HTTP and gRPC on each) by inspecting the head of every
//!   accepted connection
//! - Hot-reloadable expression routing with first-match semantics
//! - Automatic certificate issuance and renewal, gated by a host policy
//! - Transparent gRPC splicing without deserializing message bodies
//! - Bounded graceful shutdown (5 s per server, 15 s total)
//!
//! # Routing expressions
//!
//! A route is an arrow expression `predicate => value`; both sides are Rhai
//! expressions. The predicate sees `http` and `grpc` (booleans), `host` and
//! `path` (strings, host without port) and `headers` (map of lowercase
//! header name to first value); when it evaluates to true the value
//! expression must produce the backend target string. Rules are tried in
//! declaration order and the first match wins. A rule that fails to evaluate
//! is skipped, which is indistinguishable from a non-match: guard header
//! lookups with `"name" in headers`.
//!
//! # Example
//!
//! ```no_run
//! use ingress_rs::{HostPolicy, Proxy, ProxyConfig};
//!
//! # async fn run() -> ingress_rs::Result<()> {
//! let config = ProxyConfig::builder()
//!     .insecure_port(8080)
//!     .secure_port(8443)
//!     .host_policy(HostPolicy::allowed_hosts(["example.com"]))
//!     .route(r#"http && host.contains("example.com") => "http://127.0.0.1:3000""#)
//!     .route(r#"grpc => "127.0.0.1:50051""#)
//!     .build()?;
//! let proxy = Proxy::new(config)?;
//! proxy.serve(std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```

pub mod acme;
pub mod config;
pub mod demux;
pub mod error;
pub mod grpc;
pub mod http;
pub mod proxy;
pub mod router;
pub mod rule;
pub mod tls;

pub use config::{FileConfig, ProxyConfig, ProxyConfigBuilder};
pub use error::{ProxyError, Result};
pub use proxy::{Proxy, ProxyState};
pub use router::{RouteTable, Router};
pub use rule::{FactRecord, HostPolicy, Rule};
