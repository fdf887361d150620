//! Data structures, enums, and configuration for the socket engine.

use crate::socket::error::ProxyOutcome;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Process-lifetime unique connection identifier. Never reused, stable
/// across `Reactor::swap`.
pub type Uid = u64;

/// Registry slot handle. The generation disambiguates reuse of the same
/// index: a handle whose generation no longer matches the slot is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotHandle {
    pub index: u32,
    pub generation: u32,
}

/// Supported proxy protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProxyKind {
    Socks4,
    /// SOCKS4 with the hostname forwarded to the proxy for resolution.
    Socks4A,
    Socks5,
    /// HTTP/1.1 CONNECT tunnelling. Cannot open listening sockets.
    HttpConnect,
}

/// Connection target: either an address the caller already resolved or a
/// hostname. SOCKS4A, SOCKS5, and HTTP CONNECT can forward a name to the
/// proxy; plain SOCKS4 resolves it locally first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetHost {
    Ip(Ipv4Addr),
    Name(String),
}

impl TargetHost {
    /// Parses an IP literal eagerly, falling back to a name.
    pub fn parse(host: &str) -> Self {
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => TargetHost::Ip(ip),
            Err(_) => TargetHost::Name(host.to_string()),
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            TargetHost::Name(n) => Some(n),
            TargetHost::Ip(_) => None,
        }
    }

    pub fn as_ip(&self) -> Option<Ipv4Addr> {
        match self {
            TargetHost::Ip(ip) => Some(*ip),
            TargetHost::Name(_) => None,
        }
    }
}

impl std::fmt::Display for TargetHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetHost::Ip(ip) => write!(f, "{}", ip),
            TargetHost::Name(n) => write!(f, "{}", n),
        }
    }
}

/// Everything one proxied connect/listen attempt needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub proxy_ip: Ipv4Addr,
    pub proxy_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub target_host: TargetHost,
    pub target_port: u16,
    /// Locally resolved target IP, if resolution already happened.
    #[serde(default)]
    pub resolved_ip: Option<Ipv4Addr>,
}

impl ProxyConfig {
    pub fn new(kind: ProxyKind, proxy_ip: Ipv4Addr, proxy_port: u16) -> Self {
        Self {
            kind,
            proxy_ip,
            proxy_port,
            username: None,
            password: None,
            target_host: TargetHost::Ip(Ipv4Addr::UNSPECIFIED),
            target_port: 0,
        resolved_ip: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.username = Some(user.into());
        self.password = Some(pass.into());
        self
    }

    pub fn with_target(mut self, host: TargetHost, port: u16) -> Self {
        self.target_host = host;
        self.target_port = port;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    /// Best known target IP: the pre-resolved one, or an IP literal.
    pub fn target_ip(&self) -> Option<Ipv4Addr> {
        self.resolved_ip.or_else(|| self.target_host.as_ip())
    }
}

// ─── Engine configuration ────────────────────────────────────────────

fn default_connect_timeout_sec() -> u64 {
    15
}

fn default_negotiation_timeout_sec() -> u64 {
    30
}

fn default_remote_accept_timeout_sec() -> u64 {
    60
}

fn default_shutdown_timeout_sec() -> u64 {
    10
}

fn default_data_buffers() -> bool {
    false
}

/// Reactor-wide timeout policy plus per-connection socket tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// TCP connect to the proxy or target.
    #[serde(default = "default_connect_timeout_sec")]
    pub connect_timeout_sec: u64,
    /// Each proxy-negotiation phase (per reply awaited).
    #[serde(default = "default_negotiation_timeout_sec")]
    pub negotiation_timeout_sec: u64,
    /// Listen grant received, waiting for the remote peer to connect.
    #[serde(default = "default_remote_accept_timeout_sec")]
    pub remote_accept_timeout_sec: u64,
    /// Graceful shutdown before the owner is told to hard-close.
    #[serde(default = "default_shutdown_timeout_sec")]
    pub shutdown_timeout_sec: u64,
    /// Size transports for bulk transfer (256 KiB send / 4 MiB receive).
    #[serde(default = "default_data_buffers")]
    pub data_connection_buffers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: default_connect_timeout_sec(),
            negotiation_timeout_sec: default_negotiation_timeout_sec(),
            remote_accept_timeout_sec: default_remote_accept_timeout_sec(),
            shutdown_timeout_sec: default_shutdown_timeout_sec(),
            data_connection_buffers: default_data_buffers(),
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_sec)
    }

    pub fn remote_accept_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_accept_timeout_sec)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_sec)
    }
}

/// Send-buffer size applied when `data_connection_buffers` is set.
pub const DATA_SNDBUF_SIZE: usize = 256 * 1024;
/// Receive-buffer size applied when `data_connection_buffers` is set.
pub const DATA_RCVBUF_SIZE: usize = 4 * 1024 * 1024;

// ─── Connection state & events ───────────────────────────────────────

/// Coarse connection lifecycle, as observable by the owner. The detailed
/// per-proxy negotiation phases live in the `machine` module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SocketState {
    Closed,
    /// TCP connect in flight.
    Connecting,
    /// Proxy handshake in progress.
    Negotiating,
    /// Listening for an inbound connection (direct or granted by proxy).
    Listening,
    Established,
    /// TLS upgrade of an established transport in progress.
    TlsHandshake,
    /// Graceful half-close sent, waiting for the peer to close.
    ShuttingDown,
    Failed,
}

/// A peer certificate the verifier could not validate, handed to the
/// owner for the trust decision.
#[derive(Debug, Clone)]
pub struct UntrustedCert {
    /// DER encoding of the end-entity certificate.
    pub der: Vec<u8>,
    /// Why validation failed.
    pub reason: String,
}

/// Events delivered to a connection's owner. All of them originate on
/// the reactor task; the owner consumes them from its event receiver.
#[derive(Debug)]
pub enum SocketEvent {
    /// Outbound connect (direct or proxied) completed.
    Connected,
    /// Outbound connect failed; the outcome says where and why.
    ConnectFailed(ProxyOutcome),
    /// Proxy granted the listen; this is the externally reachable
    /// address the remote peer should dial.
    ListenGranted { ip: Ipv4Addr, port: u16 },
    /// An inbound connection was accepted (direct listen or the proxy's
    /// remote-accept notification). The transport is now established.
    Accepted { peer: SocketAddr },
    /// A listen attempt failed.
    AcceptFailed(ProxyOutcome),
    /// Data is available to `recv`. Re-armed by calling `recv`.
    Readable,
    /// The transport accepts writes again after `send` returned short.
    Writable,
    /// The peer closed the connection (or it broke).
    Closed { os_error: Option<i32> },
    /// TLS upgrade finished.
    TlsEstablished {
        /// Whether the handshake resumed the reused session. Callers
        /// that required reuse can fall back when this is `false`.
        session_reused: bool,
        /// Present when the certificate could not be validated and the
        /// caller opted into making the trust decision itself.
        untrusted_cert: Option<UntrustedCert>,
    },
    /// TLS upgrade failed; the transport is no longer usable.
    TlsFailed { message: String },
    /// The graceful-shutdown timer fired; the owner should `close`.
    ShutdownTimeout,
    /// An async host resolution requested by the owner completed.
    HostResolved {
        request_id: u32,
        ip: Option<Ipv4Addr>,
        os_error: Option<i32>,
    },
    /// A timer scheduled by the owner fired.
    Timer { id: u32, param: u64 },
    /// A message posted by another thread arrived.
    Message { id: u32, param: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_host_parse_prefers_ip_literal() {
        assert_eq!(
            TargetHost::parse("10.0.0.1"),
            TargetHost::Ip(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            TargetHost::parse("ftp.example.com"),
            TargetHost::Name("ftp.example.com".to_string())
        );
    }

    #[test]
    fn engine_config_defaults_deserialise() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.connect_timeout_sec, 15);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(10));
        assert!(!cfg.data_connection_buffers);
    }

    #[test]
    fn proxy_config_target_ip_precedence() {
        let mut cfg = ProxyConfig::new(ProxyKind::Socks4, Ipv4Addr::LOCALHOST, 1080)
            .with_target(TargetHost::Name("host".into()), 21);
        assert_eq!(cfg.target_ip(), None);
        cfg.resolved_ip = Some(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(cfg.target_ip(), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn proxy_config_serialises_camel_case() {
        let cfg = ProxyConfig::new(ProxyKind::HttpConnect, Ipv4Addr::LOCALHOST, 3128)
            .with_target(TargetHost::parse("example.com"), 21);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"proxyIp\""));
        assert!(json.contains("\"httpConnect\""));
    }
}
