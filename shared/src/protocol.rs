//! JSON protocol types for Mole tunnel communication.
//!
//! Every message travels as one WebSocket frame holding a JSON object.
//! The registration handshake uses [`ControlMessage`]; after that the
//! relay sends [`TunnelRequest`]s and the client answers with
//! [`TunnelResponse`]s carrying the same `id`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Path of the tunnel WebSocket endpoint on the relay.
pub const TUNNEL_PATH: &str = "/tunnel";

/// Maximum inbound body buffered by the relay (16 MB)
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Header map carried on the wire. One value per (lowercase) name.
pub type Headers = BTreeMap<String, String>;

/// Handshake messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client asks to serve a subdomain
    Register { subdomain: String },
    /// Relay accepted the registration
    Registered {
        subdomain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Relay refused the registration; the connection is closed afterwards
    RegisterFailed { subdomain: String, error: String },
}

/// HTTP request forwarded through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub id: String,
    pub method: String,
    /// Path and query, e.g. `/hello?x=1`
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// Response from the local service, echoing the request `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl TunnelResponse {
    /// Plain-text response, used when the local service could not be reached.
    pub fn error(id: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "text/plain; charset=utf-8".into());
        Self {
            id: id.into(),
            status_code,
            headers,
            body: message.into().into_bytes(),
        }
    }
}

/// Generate a fresh correlation ID: 128 random bits as 32 hex characters.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Normalise a requested subdomain, or explain why it cannot be served.
///
/// Labels may contain ASCII letters, digits and `-`, separated by `.`.
pub fn normalize_subdomain(raw: &str) -> Result<String, &'static str> {
    let subdomain = raw.trim().to_ascii_lowercase();
    if subdomain.is_empty() {
        return Err("subdomain is required");
    }
    if subdomain.len() > 253 {
        return Err("subdomain is too long");
    }
    for label in subdomain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err("subdomain labels must be 1-63 characters");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("subdomain labels cannot start or end with '-'");
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err("subdomain may only contain letters, digits, '-' and '.'");
        }
    }
    Ok(subdomain)
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_format() {
        let json = serde_json::to_value(ControlMessage::Register {
            subdomain: "demo".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "register", "subdomain": "demo"}));

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"registered","subdomain":"demo"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Registered {
                subdomain: "demo".into(),
                url: None
            }
        );

        let failed = serde_json::to_value(ControlMessage::RegisterFailed {
            subdomain: "demo".into(),
            error: "taken".into(),
        })
        .unwrap();
        assert_eq!(failed["type"], "register_failed");
    }

    #[test]
    fn test_body_is_base64() {
        let req = TunnelRequest {
            id: "abc".into(),
            method: "POST".into(),
            url: "/upload?x=1".into(),
            headers: Headers::new(),
            body: vec![0, 159, 146, 150, 255],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["body"], "AJ+Slv8=");

        let back: TunnelRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, req.body);
    }

    #[test]
    fn test_missing_or_null_body() {
        let resp: TunnelResponse =
            serde_json::from_str(r#"{"id":"x","status_code":204,"body":null}"#).unwrap();
        assert!(resp.body.is_empty());
        assert!(resp.headers.is_empty());

        let req: TunnelRequest =
            serde_json::from_str(r#"{"id":"x","method":"GET","url":"/"}"#).unwrap();
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_request_ids() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_normalize_subdomain() {
        assert_eq!(normalize_subdomain("Demo").unwrap(), "demo");
        assert_eq!(normalize_subdomain("api.v2").unwrap(), "api.v2");
        assert!(normalize_subdomain("").is_err());
        assert!(normalize_subdomain("-bad").is_err());
        assert!(normalize_subdomain("a..b").is_err());
        assert!(normalize_subdomain("has space").is_err());
        assert!(normalize_subdomain("evil:80").is_err());
    }

    #[test]
    fn test_error_response() {
        let resp = TunnelResponse::error("id1", 502, "forwarding error: refused");
        assert_eq!(resp.status_code, 502);
        assert_eq!(resp.body, b"forwarding error: refused");
        assert!(resp.headers["content-type"].starts_with("text/plain"));
    }
}
