//! Tunnel client loop
//!
//! Registers a subdomain with the relay, then serves every request the
//! relay sends on its own task. Responses share the one WebSocket, so
//! writers take turns through a mutex.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mole_shared::protocol::{ControlMessage, TunnelRequest, TunnelResponse, TUNNEL_PATH};
use mole_shared::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::proxy::Forward;

/// How long the relay has to answer the registration
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// WebSocket URL of the relay's tunnel endpoint
pub fn tunnel_url(server: &str, use_https: bool) -> String {
    let scheme = if use_https { "wss" } else { "ws" };
    format!("{}://{}{}", scheme, server, TUNNEL_PATH)
}

/// A registered tunnel, ready to serve requests
pub struct TunnelSession {
    subdomain: String,
    public_url: Option<String>,
    write: WsWriter,
    read: SplitStream<WsStream>,
}

/// Dial the relay and register `subdomain`.
pub async fn connect(url: &str, subdomain: &str) -> Result<TunnelSession> {
    info!("Connecting to relay: {}", url);

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", url, e)))?;
    let (mut write, mut read) = ws_stream.split();

    let registration = serde_json::to_string(&ControlMessage::Register {
        subdomain: subdomain.to_string(),
    })?;
    write
        .send(Message::Text(registration))
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;
    debug!("Sent registration for {}", subdomain);

    let reply = timeout(HANDSHAKE_TIMEOUT, next_payload(&mut read))
        .await
        .map_err(|_| Error::Timeout)??;

    let reply: ControlMessage = serde_json::from_slice(&reply)
        .map_err(|e| Error::Protocol(format!("malformed registration reply: {}", e)))?;

    match reply {
        ControlMessage::Registered { subdomain, url } => {
            info!("Tunnel established for {}", subdomain);
            Ok(TunnelSession {
                subdomain,
                public_url: url,
                write: Arc::new(Mutex::new(write)),
                read,
            })
        }
        ControlMessage::RegisterFailed { subdomain, error } => Err(Error::RegistrationRejected {
            subdomain,
            reason: error,
        }),
        ControlMessage::Register { .. } => Err(Error::Protocol(
            "relay answered with a register message".into(),
        )),
    }
}

async fn next_payload(read: &mut SplitStream<WsStream>) -> Result<Vec<u8>> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Connection("relay closed the connection".into()))
            }
            Some(Err(e)) => return Err(Error::Connection(e.to_string())),
            Some(Ok(_)) => continue,
        }
    }
}

impl TunnelSession {
    /// Subdomain as confirmed by the relay
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    /// Serve requests until the connection fails.
    ///
    /// Only returns with an error: losing the relay is fatal to a session.
    pub async fn run<F: Forward>(self, forwarder: Arc<F>) -> Result<()> {
        let TunnelSession {
            subdomain,
            write,
            mut read,
            ..
        } = self;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => dispatch(text.as_bytes(), &forwarder, &write)?,
                Some(Ok(Message::Binary(data))) => dispatch(&data, &forwarder, &write)?,
                Some(Ok(Message::Ping(data))) => {
                    write
                        .lock()
                        .await
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| Error::Connection(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Relay closed tunnel {}", subdomain);
                    return Err(Error::Connection("relay closed the tunnel".into()));
                }
                Some(Err(e)) => return Err(Error::Connection(e.to_string())),
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Decode one request and answer it on a task of its own.
fn dispatch<F: Forward>(payload: &[u8], forwarder: &Arc<F>, write: &WsWriter) -> Result<()> {
    let request: TunnelRequest = serde_json::from_slice(payload)
        .map_err(|e| Error::Protocol(format!("malformed request: {}", e)))?;

    let forwarder = Arc::clone(forwarder);
    let write = Arc::clone(write);
    tokio::spawn(async move {
        let response = handle_request(forwarder.as_ref(), request).await;
        if let Err(e) = send_response(&write, &response).await {
            warn!("Failed to send response {}: {}", response.id, e);
        }
    });
    Ok(())
}

/// Run `request` through the forwarder, turning failures into a 502.
pub async fn handle_request<F: Forward>(forwarder: &F, request: TunnelRequest) -> TunnelResponse {
    let id = request.id.clone();
    let summary = format!("{} {}", request.method, request.url);

    match forwarder.forward(request).await {
        Ok(local) => {
            info!("{} -> {}", summary, local.status_code);
            TunnelResponse {
                id,
                status_code: local.status_code,
                headers: local.headers,
                body: local.body,
            }
        }
        Err(e) => {
            warn!("{} failed: {}", summary, e);
            TunnelResponse::error(id, 502, format!("forwarding error: {}", e))
        }
    }
}

async fn send_response(write: &WsWriter, response: &TunnelResponse) -> Result<()> {
    let frame = serde_json::to_string(response)?;
    write
        .lock()
        .await
        .send(Message::Text(frame))
        .await
        .map_err(|e| Error::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::LocalResponse;
    use mole_shared::protocol::Headers;

    struct Fixed(Result<u16>);

    impl Forward for Fixed {
        async fn forward(&self, request: TunnelRequest) -> Result<LocalResponse> {
            match &self.0 {
                Ok(status) => Ok(LocalResponse {
                    status_code: *status,
                    headers: Headers::new(),
                    body: request.url.into_bytes(),
                }),
                Err(_) => Err(Error::Forward("connection refused".into())),
            }
        }
    }

    fn request() -> TunnelRequest {
        TunnelRequest {
            id: "abc".into(),
            method: "GET".into(),
            url: "/hello".into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_tunnel_url() {
        assert_eq!(tunnel_url("localhost:3000", false), "ws://localhost:3000/tunnel");
        assert_eq!(tunnel_url("relay.example.com", true), "wss://relay.example.com/tunnel");
    }

    #[tokio::test]
    async fn test_success_keeps_id_and_payload() {
        let resp = handle_request(&Fixed(Ok(201)), request()).await;
        assert_eq!(resp.id, "abc");
        assert_eq!(resp.status_code, 201);
        assert_eq!(resp.body, b"/hello");
    }

    #[tokio::test]
    async fn test_failure_becomes_502() {
        let resp = handle_request(&Fixed(Err(Error::Timeout)), request()).await;
        assert_eq!(resp.id, "abc");
        assert_eq!(resp.status_code, 502);
        let body = String::from_utf8(resp.body).unwrap();
        assert!(body.starts_with("forwarding error:"), "{}", body);
        assert!(body.contains("connection refused"));
    }
}
