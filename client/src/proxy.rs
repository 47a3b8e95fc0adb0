//! Local proxy for forwarding requests
//!
//! Replays a tunneled request against the service on this machine.

use std::future::Future;
use std::time::Duration;

use mole_shared::headers::is_hop_by_hop;
use mole_shared::protocol::{Headers, TunnelRequest};
use mole_shared::{Error, Result};
use reqwest::redirect::Policy;
use tracing::debug;

/// Response produced by the local service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Something that can answer a tunneled request.
pub trait Forward: Send + Sync + 'static {
    fn forward(&self, request: TunnelRequest) -> impl Future<Output = Result<LocalResponse>> + Send;
}

/// Forwards requests to `http://<host>:<port>` over HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    base_url: String,
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(local_host: &str, local_port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| Error::Forward(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: format!("http://{}:{}", local_host, local_port),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Headers that must not be replayed: `host` is set from the local target,
/// `content-length` from the body.
fn skip_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") || is_hop_by_hop(name)
}

impl Forward for HttpForwarder {
    async fn forward(&self, request: TunnelRequest) -> Result<LocalResponse> {
        let url = format!("{}{}", self.base_url, request.url);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Forward(format!("invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in request.headers.iter().filter(|(name, _)| !skip_header(name)) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        debug!(
            "Forwarding {} {} ({} body bytes)",
            request.method,
            url,
            request.body.len()
        );
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Forward(format!("request to {} failed: {}", url, e)))?;

        let status_code = resp.status().as_u16();
        let mut headers = Headers::new();
        for name in resp.headers().keys() {
            if let Some(value) = resp.headers().get(name).and_then(|v| v.to_str().ok()) {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Forward(format!("failed to read response: {}", e)))?
            .to_vec();

        debug!("Local service answered {} ({} bytes)", status_code, body.len());
        Ok(LocalResponse {
            status_code,
            headers,
            body,
        })
    }
}
