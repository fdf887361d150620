//! Async hostname resolution for the reactor.
//!
//! Resolution runs on its own tokio task; the result lands in the
//! reactor's resolution mailbox tagged with the requesting connection's
//! UID, so a late result for a deregistered connection is dropped on
//! arrival.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::lookup_host;

/// Resolves `name` to an IPv4 address. IP literals short-circuit
/// without touching DNS.
pub async fn resolve_ipv4(name: &str) -> io::Result<Ipv4Addr> {
    if let Ok(ip) = name.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = lookup_host((name, 0)).await?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no IPv4 address for '{}'", name),
    ))
}
