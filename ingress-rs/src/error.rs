//! Error types for ingress-rs

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A routing expression failed to compile
    #[error("Invalid routing rule: {0}")]
    BadRule(String),

    /// A compiled rule failed while evaluating against a request
    #[error("Rule evaluation failed: {0}")]
    RuleEval(String),

    /// No rule produced a target for the request
    #[error("No route found for {host}{path}")]
    NoRoute { host: String, path: String },

    /// Failed to bind a listener
    #[error("Failed to bind listener: {0}")]
    Listen(#[source] std::io::Error),

    /// Host rejected by the certificate host policy
    #[error("Forbidden host: {0}")]
    ForbiddenHost(String),

    /// Backend connection error
    #[error("Backend connection error: {0}")]
    BackendDial(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// ACME error
    #[error("ACME error: {0}")]
    Acme(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
