//! gRPC stream director.
//!
//! The gRPC servers run at the frame level: every stream accepted over a
//! demuxed connection is routed by `:authority` and full method name, a
//! plaintext HTTP/2 channel is opened to the backend (TLS terminates at the
//! proxy), and DATA frames and trailers are spliced in both directions
//! without deserializing message bodies.

use bytes::Bytes;
use h2::server::{self, SendResponse};
use h2::{client, RecvStream, SendStream};
use http::{header, HeaderValue, Request, Response, StatusCode, Uri, Version};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::GrpcInit;
use crate::demux::{BoxedIo, VirtualListener};
use crate::error::{ProxyError, Result};
use crate::proxy::{Shutdown, SHUTDOWN_PER_SERVER};
use crate::router::Router as ProxyRouter;
use crate::rule::FactRecord;

const GRPC_INVALID_ARGUMENT: u32 = 3;
const GRPC_PERMISSION_DENIED: u32 = 7;
const GRPC_UNIMPLEMENTED: u32 = 12;
const GRPC_UNAVAILABLE: u32 = 14;

/// Serve one virtual listener until shutdown, then drain.
pub(crate) async fn serve(
    mut listener: VirtualListener,
    router: Arc<ProxyRouter>,
    inits: Vec<GrpcInit>,
    shutdown: Shutdown,
    label: &'static str,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Some(io) => {
                    let mut builder = server::Builder::new();
                    for init in &inits {
                        init(&mut builder);
                    }
                    connections.spawn(serve_connection(
                        io,
                        builder,
                        router.clone(),
                        shutdown.clone(),
                        label,
                    ));
                }
                None => break,
            }
        }
    }
    // GracefulStop with a hard stop at the deadline
    let drained = tokio::time::timeout(SHUTDOWN_PER_SERVER, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(server = label, "Drain deadline elapsed, stopping gRPC server");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
    debug!(server = label, "gRPC server stopped");
}

async fn serve_connection(
    io: BoxedIo,
    builder: server::Builder,
    router: Arc<ProxyRouter>,
    shutdown: Shutdown,
    label: &'static str,
) {
    let mut connection = match builder.handshake(io).await {
        Ok(connection) => connection,
        Err(e) => {
            debug!(server = label, error = %e, "gRPC handshake failed");
            return;
        }
    };
    let mut streams = JoinSet::new();
    let mut draining = false;
    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                connection.graceful_shutdown();
            }
            next = connection.accept() => match next {
                Some(Ok((request, respond))) => {
                    let router = router.clone();
                    streams.spawn(async move {
                        if let Err(e) = proxy_stream(request, respond, router).await {
                            debug!(error = %e, "gRPC stream ended with error");
                        }
                    });
                }
                Some(Err(e)) => {
                    debug!(server = label, error = %e, "gRPC connection error");
                    break;
                }
                None => break,
            }
        }
    }
    while streams.join_next().await.is_some() {}
}

/// The stream director: route by `:authority`, dial, splice.
async fn proxy_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    router: Arc<ProxyRouter>,
) -> Result<()> {
    let authority = request
        .uri()
        .authority()
        .map(|a| a.to_string())
        .filter(|a| !a.is_empty());
    let Some(authority) = authority else {
        return send_status(&mut respond, GRPC_UNIMPLEMENTED, "unknown method");
    };
    let full_method = request.uri().path().to_string();

    let mut metadata = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            metadata
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let fact = FactRecord::grpc(&authority, &full_method, metadata);
    let target = match router.find(&fact) {
        Ok(target) => target,
        Err(ProxyError::NoRoute { .. }) => {
            return send_status(&mut respond, GRPC_PERMISSION_DENIED, "unknown route");
        }
        Err(e) => {
            return send_status(&mut respond, GRPC_INVALID_ARGUMENT, &e.to_string());
        }
    };
    let addr = match dial_address(&target) {
        Ok(addr) => addr,
        Err(e) => {
            return send_status(&mut respond, GRPC_INVALID_ARGUMENT, &e.to_string());
        }
    };

    debug!(method = %full_method, authority = %authority, target = %addr, "Proxying gRPC stream");

    // insecure backend leg; TLS terminated at the proxy
    let tcp = match TcpStream::connect(&addr).await {
        Ok(tcp) => tcp,
        Err(e) => {
            return send_status(
                &mut respond,
                GRPC_UNAVAILABLE,
                &format!("dial {addr}: {e}"),
            );
        }
    };
    let _ = tcp.set_nodelay(true);
    let (mut channel, connection) = match client::handshake(tcp).await {
        Ok(pair) => pair,
        Err(e) => {
            return send_status(
                &mut respond,
                GRPC_UNAVAILABLE,
                &format!("handshake {addr}: {e}"),
            );
        }
    };
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Backend gRPC connection closed");
        }
    });

    // Invert the metadata: the inbound headers travel with the dial.
    let (parts, inbound_body) = request.into_parts();
    let mut builder = Request::builder()
        .method(parts.method)
        .version(Version::HTTP_2)
        .uri(backend_uri(&addr, &parts.uri)?);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    let outbound = builder
        .body(())
        .map_err(|e| ProxyError::BackendDial(e.to_string()))?;

    let request_done = inbound_body.is_end_stream();
    let (response_future, upstream_body) = match channel.send_request(outbound, request_done) {
        Ok(pair) => pair,
        Err(e) => {
            return send_status(
                &mut respond,
                GRPC_UNAVAILABLE,
                &format!("send {addr}: {e}"),
            );
        }
    };

    // client → backend
    let upstream_copy = if request_done {
        None
    } else {
        Some(tokio::spawn(copy_stream(inbound_body, upstream_body)))
    };

    let response = match response_future.await {
        Ok(response) => response,
        Err(e) => {
            if let Some(copy) = upstream_copy {
                copy.abort();
            }
            return send_status(
                &mut respond,
                GRPC_UNAVAILABLE,
                &format!("backend {addr}: {e}"),
            );
        }
    };

    // backend → client
    let (parts, backend_body) = response.into_parts();
    let response_done = backend_body.is_end_stream();
    let mut head = Response::builder()
        .status(parts.status)
        .version(Version::HTTP_2);
    for (name, value) in &parts.headers {
        head = head.header(name, value);
    }
    let head = head
        .body(())
        .map_err(|e| ProxyError::BackendDial(e.to_string()))?;

    match respond.send_response(head, response_done) {
        Ok(downstream) => {
            if !response_done {
                copy_stream(backend_body, downstream).await;
            }
        }
        Err(e) => {
            debug!(error = %e, "Failed to relay gRPC response headers");
        }
    }

    if let Some(copy) = upstream_copy {
        let _ = copy.await;
    }
    Ok(())
}

/// Copy DATA frames and trailers from one stream to the other.
async fn copy_stream(mut from: RecvStream, mut to: SendStream<Bytes>) {
    while let Some(chunk) = from.data().await {
        match chunk {
            Ok(data) => {
                let len = data.len();
                if to.send_data(data, false).is_err() {
                    return;
                }
                let _ = from.flow_control().release_capacity(len);
            }
            Err(_) => {
                to.send_reset(h2::Reason::CANCEL);
                return;
            }
        }
    }
    match from.trailers().await {
        Ok(Some(trailers)) => {
            let _ = to.send_trailers(trailers);
        }
        Ok(None) => {
            let _ = to.send_data(Bytes::new(), true);
        }
        Err(_) => {
            to.send_reset(h2::Reason::CANCEL);
        }
    }
}

/// A gRPC error as a trailers-only response.
fn send_status(respond: &mut SendResponse<Bytes>, code: u32, message: &str) -> Result<()> {
    let mut head = Response::builder()
        .status(StatusCode::OK)
        .version(Version::HTTP_2)
        .header(header::CONTENT_TYPE, "application/grpc")
        .header("grpc-status", code.to_string());
    if let Ok(value) = HeaderValue::from_str(message) {
        head = head.header("grpc-message", value);
    }
    let head = head
        .body(())
        .map_err(|e| ProxyError::BackendDial(e.to_string()))?;
    let _ = respond.send_response(head, true);
    Ok(())
}

/// Resolve the dial address from a routing target.
///
/// Accepts `host:port` directly or a `grpc://` / `http://` / `https://`
/// prefixed form; the scheme is stripped for the dial.
fn dial_address(target: &str) -> Result<String> {
    let trimmed = target
        .strip_prefix("grpc://")
        .or_else(|| target.strip_prefix("https://"))
        .or_else(|| target.strip_prefix("http://"))
        .unwrap_or(target);
    let authority = trimmed.split('/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(ProxyError::BackendDial(format!(
            "target has no authority: {target}"
        )));
    }
    if !authority.contains(':') {
        return Err(ProxyError::BackendDial(format!(
            "target has no port: {target}"
        )));
    }
    Ok(authority.to_string())
}

fn backend_uri(addr: &str, inbound: &Uri) -> Result<Uri> {
    let path_and_query = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme("http")
        .authority(addr)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::BackendDial(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_address_plain() {
        assert_eq!(dial_address("127.0.0.1:50051").unwrap(), "127.0.0.1:50051");
    }

    #[test]
    fn test_dial_address_strips_schemes() {
        assert_eq!(dial_address("grpc://svc:50051").unwrap(), "svc:50051");
        assert_eq!(dial_address("http://svc:8080/x").unwrap(), "svc:8080");
        assert_eq!(dial_address("https://svc:443").unwrap(), "svc:443");
    }

    #[test]
    fn test_dial_address_requires_port() {
        assert!(matches!(
            dial_address("svc.local"),
            Err(ProxyError::BackendDial(_))
        ));
    }

    #[test]
    fn test_dial_address_rejects_empty() {
        assert!(dial_address("grpc://").is_err());
    }

    #[test]
    fn test_backend_uri() {
        let inbound: Uri = "http://proxy.example/pkg.Service/Method".parse().unwrap();
        let uri = backend_uri("127.0.0.1:50051", &inbound).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:50051/pkg.Service/Method");
    }
}
