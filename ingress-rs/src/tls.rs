//! TLS termination for the secure listener.

use rustls::{version, ServerConfig};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::acme::CertManager;
use crate::error::{ProxyError, Result};

/// Build the acceptor for the TLS listener, backed by the ACME resolver.
///
/// ALPN offers `h2` and `http/1.1` so both browser HTTP/2 and gRPC clients
/// can negotiate. The crypto provider is passed explicitly rather than read
/// from process-global state.
pub(crate) fn build_acceptor(certs: &Arc<CertManager>) -> Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&version::TLS12, &version::TLS13])
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(certs.resolver());
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}
