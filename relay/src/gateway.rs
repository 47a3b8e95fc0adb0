//! Public HTTP gateway
//!
//! Terminates public requests for `<subdomain>.<domain>`, sends them down
//! the matching tunnel and waits for the correlated response.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::HOST, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use mole_shared::headers::{insert_forwarded, strip_hop_by_hop};
use mole_shared::protocol::{new_request_id, Headers, TunnelRequest, TunnelResponse};
use tracing::{debug, warn};

use crate::pending::PendingError;
use crate::tunnel::DispatchError;
use crate::AppState;

/// Subdomain addressed by `host` under `base_domain`.
///
/// `host` may carry a port. The base domain itself, and any host outside
/// it, has no subdomain.
pub fn extract_subdomain<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let host = host.split(':').next().unwrap_or(host);
    let subdomain = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    (!subdomain.is_empty()).then_some(subdomain)
}

/// Lowercased host of a request, from `Host` or the URI authority.
pub fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .map(|h| h.trim().to_ascii_lowercase())
}

/// Whether the request is addressed to a tunnel rather than the relay itself.
pub fn is_tunnel_request(req: &Request, base_domain: &str) -> bool {
    request_host(req)
        .map(|host| extract_subdomain(&host, base_domain).is_some())
        .unwrap_or(false)
}

pub async fn health_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    if is_tunnel_request(&req, &state.config.domain) {
        return proxy_handler(State(state), peer, req).await;
    }
    "OK".into_response()
}

pub async fn proxy_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    let Some(host) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "invalid subdomain").into_response();
    };
    let Some(subdomain) = extract_subdomain(&host, &state.config.domain) else {
        return (StatusCode::BAD_REQUEST, "invalid subdomain").into_response();
    };

    let Some(tunnel) = state.registry.lookup(subdomain) else {
        warn!("No tunnel: {}", subdomain);
        return (StatusCode::NOT_FOUND, "tunnel not found").into_response();
    };

    let (parts, body) = req.into_parts();

    let limit = state.config.max_body_size;
    if declared_length(&parts.headers).is_some_and(|len| len > limit) {
        return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
    }
    let body = match axum::body::to_bytes(body, limit).await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            warn!("Failed to read body for {}: {}", subdomain, e);
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let mut headers = flatten_headers(&parts.headers);
    let client_ip = peer.map(|ConnectInfo(addr)| addr.ip().to_string());
    insert_forwarded(&mut headers, client_ip.as_deref(), &host, state.config.scheme());

    let request = TunnelRequest {
        id: new_request_id(),
        method: parts.method.to_string(),
        url: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers,
        body,
    };

    let waiter = match state.pending.create(request.id.clone()) {
        Ok(w) => w,
        Err(e) => {
            warn!("Cannot track request: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to forward request").into_response();
        }
    };

    // one deadline covers queueing the request and waiting for the answer
    let deadline = Instant::now() + state.request_timeout();

    debug!("{} {} -> {} [{}]", request.method, request.url, subdomain, request.id);
    match tunnel.send(&request, state.request_timeout()).await {
        Ok(()) => {}
        Err(DispatchError::Stalled) => {
            warn!("Tunnel {} is not draining its queue", subdomain);
            return (StatusCode::GATEWAY_TIMEOUT, "request timeout").into_response();
        }
        Err(e) => {
            // dropping the waiter clears the pending entry
            warn!("Dispatch to {} failed: {}", subdomain, e);
            return (StatusCode::BAD_GATEWAY, "failed to forward request").into_response();
        }
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    match waiter.await_or_timeout(remaining).await {
        Ok(resp) => build_response(resp),
        Err(PendingError::TimedOut) => {
            warn!("Request {} to {} timed out", request.id, subdomain);
            (StatusCode::GATEWAY_TIMEOUT, "request timeout").into_response()
        }
        Err(e) => {
            warn!("Request {} to {} failed: {}", request.id, subdomain, e);
            (StatusCode::BAD_GATEWAY, "tunnel closed").into_response()
        }
    }
}

/// One value per header name: the first one wins.
fn flatten_headers(headers: &HeaderMap) -> Headers {
    headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

fn build_response(mut resp: TunnelResponse) -> Response {
    let Ok(status) = StatusCode::from_u16(resp.status_code) else {
        warn!("Tunnel returned invalid status {}", resp.status_code);
        return (StatusCode::BAD_GATEWAY, "invalid response from tunnel").into_response();
    };

    strip_hop_by_hop(&mut resp.headers);
    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = status;
    let headers_mut = response.headers_mut();
    for (k, v) in resp.headers {
        if let (Ok(hn), Ok(hv)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
            headers_mut.insert(hn, hv);
        }
    }
    response
}
