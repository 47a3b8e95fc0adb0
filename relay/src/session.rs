//! Tunnel session loop
//!
//! One task per client connection. The connection starts by registering a
//! subdomain; once accepted it carries requests out and responses back
//! until either side goes away, at which point the subdomain is released.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, FromRequestParts, Request, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, StreamExt};
use mole_shared::protocol::{normalize_subdomain, ControlMessage, TunnelResponse};
use mole_shared::{Error, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::gateway;
use crate::tunnel::{Tunnel, OUTBOUND_QUEUE};
use crate::AppState;

/// How long a new connection may take to send its registration
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long one frame may take to reach the socket before the peer is
/// considered gone
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    if gateway::is_tunnel_request(&req, &state.config.domain) {
        return gateway::proxy_handler(State(state), peer, req).await;
    }

    let (mut parts, _body) = req.into_parts();
    match <WebSocketUpgrade as FromRequestParts<AppState>>::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(rejection) => rejection.into_response(),
    }
}

pub async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let requested = match read_registration(&mut socket).await {
        Ok(subdomain) => subdomain,
        Err(e) => {
            warn!("Dropping tunnel connection: {}", e);
            return;
        }
    };

    let subdomain = match normalize_subdomain(&requested) {
        Ok(s) => s,
        Err(reason) => {
            warn!("Refusing subdomain {:?}: {}", requested, reason);
            refuse(socket, requested, reason.to_string()).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let tunnel = Tunnel::new(subdomain.clone(), tx);

    if let Err(e) = state.registry.register(tunnel.clone()) {
        warn!("Refusing tunnel: {}", e);
        refuse(socket, subdomain, e.to_string()).await;
        return;
    }

    let url = state.config.public_url(&subdomain);
    let ack = ControlMessage::Registered {
        subdomain: subdomain.clone(),
        url: Some(url.clone()),
    };
    if send_control(&mut socket, &ack).await.is_err() {
        state.registry.deregister(&subdomain, tunnel.id());
        return;
    }

    info!("Tunnel active: {}", url);

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !route_response(&state, &subdomain, text.as_bytes()) { break; }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !route_response(&state, &subdomain, &data) { break; }
                    }
                    Some(Ok(Message::Ping(d))) => {
                        if let Err(e) = write_frame(&mut sender, Message::Pong(d), WRITE_TIMEOUT).await {
                            warn!("Tunnel {} write error: {}", subdomain, e);
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Tunnel {} read error: {}", subdomain, e);
                        break;
                    }
                }
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = write_frame(&mut sender, frame, WRITE_TIMEOUT).await {
                    warn!("Tunnel {} write error: {}", subdomain, e);
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = write_frame(&mut sender, Message::Ping(Vec::new()), WRITE_TIMEOUT).await {
                    warn!("Tunnel {} heartbeat failed: {}", subdomain, e);
                    break;
                }
            }
        }
    }

    state.registry.deregister(&subdomain, tunnel.id());
    info!(
        "Tunnel {} closed after {:?}",
        subdomain,
        tunnel.connected_at().elapsed()
    );
}

/// Read the first message, which must be a registration.
async fn read_registration(socket: &mut WebSocket) -> Result<String> {
    let payload = timeout(HANDSHAKE_TIMEOUT, next_payload(socket))
        .await
        .map_err(|_| Error::Timeout)??;

    match serde_json::from_slice::<ControlMessage>(&payload)? {
        ControlMessage::Register { subdomain } if !subdomain.trim().is_empty() => Ok(subdomain),
        ControlMessage::Register { .. } => Err(Error::Protocol("subdomain is required".into())),
        other => Err(Error::Protocol(format!(
            "expected register message, got {:?}",
            other
        ))),
    }
}

async fn next_payload(socket: &mut WebSocket) -> Result<Vec<u8>> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Connection("closed before registering".into()))
            }
            Some(Err(e)) => return Err(Error::Connection(e.to_string())),
        }
    }
}

/// Write one frame, giving up after `limit`.
async fn write_frame<S>(sender: &mut S, frame: Message, limit: Duration) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match timeout(limit, sender.send(frame)).await {
        Ok(sent) => sent.map_err(|e| Error::Connection(e.to_string())),
        Err(_) => Err(Error::Timeout),
    }
}

async fn send_control(socket: &mut WebSocket, msg: &ControlMessage) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| Error::Connection(e.to_string()))
}

async fn refuse(mut socket: WebSocket, subdomain: String, error: String) {
    let msg = ControlMessage::RegisterFailed { subdomain, error };
    let _ = send_control(&mut socket, &msg).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Deliver one inbound frame. Returns `false` on a protocol violation.
fn route_response(state: &AppState, subdomain: &str, payload: &[u8]) -> bool {
    match serde_json::from_slice::<TunnelResponse>(payload) {
        Ok(response) => {
            debug!("Response {} from {} ({})", response.id, subdomain, response.status_code);
            state.handle_response(response);
            true
        }
        Err(e) => {
            warn!("Tunnel {} sent a malformed response: {}", subdomain, e);
            false
        }
    }
}
