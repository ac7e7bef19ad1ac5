//! HTTP reverse-proxy handler stack.
//!
//! Layering, outermost first: ACME challenge route, panic recovery and
//! tracing, the user middleware chain in insertion order, and innermost the
//! reverse proxy itself (or the HTTPS redirect in redirect mode).

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, Request, Response, StatusCode, Uri, Version},
    response::IntoResponse,
    routing::get,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::collections::HashMap;
use std::time::Duration;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error};
use url::Url;

use crate::acme::ChallengeStore;
use crate::config::HttpMiddleware;
use crate::router::Router as ProxyRouter;
use crate::rule::FactRecord;

/// HTTP client type for forwarding requests.
pub(crate) type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// Build the forwarding client. `https://` targets dial TLS backends.
pub(crate) fn build_client() -> crate::error::Result<HttpClient> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|e| crate::error::ProxyError::Tls(e.to_string()))?
        .https_or_http()
        .enable_all_versions()
        .build();
    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .build(https))
}

/// Shared handler state.
#[derive(Clone)]
pub(crate) struct HttpState {
    pub router: std::sync::Arc<ProxyRouter>,
    pub client: HttpClient,
    pub challenges: ChallengeStore,
}

/// Build the handler stack for one HTTP server.
pub(crate) fn build_router(
    state: HttpState,
    middlewares: &[HttpMiddleware],
    redirect_https: bool,
) -> Router {
    let challenges = state.challenges.clone();
    let mut inner = if redirect_https {
        Router::new().fallback(redirect_handler)
    } else {
        Router::new().fallback(proxy_handler).with_state(state)
    };
    for middleware in middlewares {
        inner = middleware(inner);
    }
    Router::new()
        .route(
            "/.well-known/acme-challenge/:token",
            get(challenge_handler).with_state(challenges),
        )
        .fallback_service(inner)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Serve HTTP-01 challenge responses from the ACME manager.
async fn challenge_handler(
    State(challenges): State<ChallengeStore>,
    Path(token): Path<String>,
) -> Response<Body> {
    match challenges.get(&token).await {
        Some(key_auth) => {
            debug!(token = %token, "Serving ACME challenge");
            (StatusCode::OK, key_auth).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Redirect-mode inner handler: constant 301 to the HTTPS origin.
async fn redirect_handler(req: Request<Body>) -> Response<Body> {
    let (_, authority) = request_facts(&req);
    let host = authority.split(':').next().unwrap_or("");
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", host, path_and_query);
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Reverse-proxy handler: route, rewrite, forward, stream back.
async fn proxy_handler(State(state): State<HttpState>, req: Request<Body>) -> Response<Body> {
    let (fact, authority) = request_facts(&req);

    let target = match state.router.find(&fact) {
        Ok(target) => target,
        Err(e) => {
            debug!(host = %fact.host, path = %fact.path, error = %e, "No routing target");
            return bad_gateway();
        }
    };

    let target_url = match Url::parse(&target) {
        Ok(url) => url,
        Err(e) => {
            debug!(target = %target, error = %e, "Failed to parse routing target");
            return bad_gateway();
        }
    };

    let outbound = match rewrite_request(req, &target_url, &authority) {
        Some(outbound) => outbound,
        None => return bad_gateway(),
    };

    debug!(host = %fact.host, path = %fact.path, target = %target, "Proxying request");

    match state.client.request(outbound).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            error!(target = %target, error = %e, "Backend request failed");
            bad_gateway()
        }
    }
}

fn bad_gateway() -> Response<Body> {
    StatusCode::BAD_GATEWAY.into_response()
}

/// The director: point the request at the target, joining paths and queries.
fn rewrite_request(
    req: Request<Body>,
    target: &Url,
    authority: &str,
) -> Option<Request<Body>> {
    let (mut parts, body) = req.into_parts();

    let target_authority = match target.port() {
        Some(port) => format!("{}:{}", target.host_str()?, port),
        None => target.host_str()?.to_string(),
    };
    let path = single_joining_slash(target.path(), parts.uri.path());
    let query = join_queries(target.query().unwrap_or(""), parts.uri.query().unwrap_or(""));
    let path_and_query = if query.is_empty() {
        path
    } else {
        format!("{}?{}", path, query)
    };

    parts.uri = Uri::builder()
        .scheme(target.scheme())
        .authority(target_authority)
        .path_and_query(path_and_query)
        .build()
        .ok()?;
    // let the pooled connection decide the wire protocol
    parts.version = Version::HTTP_11;

    // Remove hop-by-hop headers
    parts.headers.remove(header::CONNECTION);
    parts.headers.remove("keep-alive");
    parts.headers.remove(header::PROXY_AUTHENTICATE);
    parts.headers.remove(header::PROXY_AUTHORIZATION);
    parts.headers.remove(header::TE);
    parts.headers.remove(header::TRAILER);
    parts.headers.remove(header::TRANSFER_ENCODING);
    parts.headers.remove(header::UPGRADE);

    // Keep the inbound authority as the Host the backend sees
    if !parts.headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(authority) {
            parts.headers.insert(header::HOST, value);
        }
    }

    // Explicitly disable User-Agent so the client inserts no default
    if !parts.headers.contains_key(header::USER_AGENT) {
        parts
            .headers
            .insert(header::USER_AGENT, HeaderValue::from_static(""));
    }

    Some(Request::from_parts(parts, body))
}

/// Build the fact record and return it with the raw request authority.
fn request_facts(req: &Request<Body>) -> (FactRecord, String) {
    let authority = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default();

    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    (
        FactRecord::http(&authority, req.uri().path(), headers),
        authority,
    )
}

/// Join two URL paths with exactly one slash at the boundary.
fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Merge the target query with the incoming query.
fn join_queries(a: &str, b: &str) -> String {
    if a.is_empty() || b.is_empty() {
        format!("{}{}", a, b)
    } else {
        format!("{}&{}", a, b)
    }
}
