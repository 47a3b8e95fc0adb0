//! Header rewriting shared by relay and client.
//!
//! Headers that describe a single hop (connection management, framing)
//! are meaningless once a request is replayed against another host, so
//! both ends strip them before building the next hop.

use crate::protocol::Headers;

/// Connection-scoped headers that are never carried across the tunnel.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Remove hop-by-hop headers and `content-length`, which the next hop
/// recomputes from the buffered body.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    headers.retain(|name, _| !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("content-length"));
}

/// Add the standard `x-forwarded-*` headers for a proxied request.
pub fn insert_forwarded(headers: &mut Headers, client_ip: Option<&str>, host: &str, proto: &str) {
    if let Some(ip) = client_ip {
        let value = match get(headers, "x-forwarded-for") {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip.to_string(),
        };
        upsert(headers, "x-forwarded-for", &value);
    }
    upsert(headers, "x-forwarded-host", host);
    upsert(headers, "x-forwarded-proto", proto);
}

/// Case-insensitive lookup
pub fn get<'a>(headers: &'a Headers, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Insert or replace a header, matching names case-insensitively
fn upsert(headers: &mut Headers, key: &str, value: &str) {
    headers.retain(|name, _| !name.eq_ignore_ascii_case(key));
    headers.insert(key.to_string(), value.to_string());
}
