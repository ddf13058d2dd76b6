//! Outward-facing address resolution
//!
//! Connecting a UDP socket sends no packets; the OS only picks a route and a
//! local endpoint for it. That endpoint is the address other hosts should use
//! to reach this machine. Behind several NAT layers or with multiple active
//! interfaces this is a best guess, not a guarantee.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use thiserror::Error;

/// Well-known public address used only to select a route
const ROUTE_TARGET: &str = "8.8.8.8:80";

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("No route to the network: {0}")]
    NoRoute(#[source] std::io::Error),

    #[error("Resolved an unspecified local address")]
    Unspecified,
}

/// Resolve the address this host is reachable at
pub fn resolve_local_address() -> Result<IpAddr, NetworkError> {
    resolve_via(ROUTE_TARGET)
}

fn resolve_via(target: &str) -> Result<IpAddr, NetworkError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(NetworkError::NoRoute)?;
    socket.connect(target).map_err(NetworkError::NoRoute)?;
    let local: SocketAddr = socket.local_addr().map_err(NetworkError::NoRoute)?;

    if local.ip().is_unspecified() {
        return Err(NetworkError::Unspecified);
    }

    tracing::debug!("Resolved local address {}", local.ip());
    Ok(local.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_route_resolves_loopback() {
        let ip = resolve_via("127.0.0.1:9").unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_unroutable_target_fails() {
        // IPv6 target from an IPv4 socket can never be routed
        let result = resolve_via("[::1]:9");
        assert!(matches!(result, Err(NetworkError::NoRoute(_))));
    }
}
