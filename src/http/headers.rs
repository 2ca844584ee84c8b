//! Header manipulation for proxied requests and responses.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;

pub const X_DEBUG: &str = "x-debug";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_PROTOCOL: &str = "x-forwarded-protocol";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Headers that apply to a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client address as it should appear in forwarding headers.
///
/// IPv4-mapped IPv6 addresses are reported in dotted form.
pub fn client_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

fn insert_absent(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let name = HeaderName::from_static(name);
    if headers.contains_key(&name) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Add the forwarding headers a backend expects, keeping any already set upstream.
pub fn inject_forwarded(headers: &mut HeaderMap, remote: IpAddr, local_port: Option<u16>) {
    let ip = client_ip(remote).to_string();
    insert_absent(headers, X_FORWARDED_FOR, &ip);
    insert_absent(headers, X_REAL_IP, &ip);
    insert_absent(headers, X_FORWARDED_PROTO, "http");
    insert_absent(headers, X_FORWARDED_PROTOCOL, "http");
    let port = local_port.unwrap_or(80).to_string();
    insert_absent(headers, X_FORWARDED_PORT, &port);
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// True for `Connection: upgrade` + `Upgrade: websocket` requests.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade
        && headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

pub fn wants_debug(headers: &HeaderMap) -> bool {
    headers.contains_key(X_DEBUG)
}
