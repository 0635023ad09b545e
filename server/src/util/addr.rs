//! Advertise address resolution.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Splits `host:port`, accepting bracketed IPv6 hosts. A missing port yields
/// an empty port string.
#[must_use]
pub fn split_host_port(addr: &str) -> (String, String) {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').unwrap_or_default();
            return (host.to_string(), port.to_string());
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host.to_string(), port.to_string()),
        _ => (addr.to_string(), String::new()),
    }
}

/// Joins host and port, bracketing IPv6 literals. An empty port yields the
/// host alone.
#[must_use]
pub fn join_host_port(host: &str, port: &str) -> String {
    if port.is_empty() {
        host.to_string()
    } else if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// True for empty hosts and the wildcard addresses.
#[must_use]
pub fn is_unspecified(host: &str) -> bool {
    matches!(host, "" | "0.0.0.0" | "::" | "[::]")
}

/// Resolves the host to advertise. Wildcard hosts are replaced by the
/// address of the interface that routes outward.
#[must_use]
pub fn extract(host: &str) -> String {
    if is_unspecified(host) {
        local_ip().to_string()
    } else {
        host.to_string()
    }
}

/// True when the host is an IP literal rather than a name.
#[must_use]
pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// Address of the outward facing interface, or loopback when there is none.
/// Connecting a UDP socket sends no packets; it only selects a route.
#[must_use]
pub fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
