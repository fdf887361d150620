//! Socket-engine error types.
//!
//! Two layers: `SocketError` for failures of the engine API itself, and
//! `ProxyOutcome` for the classified result of a proxy negotiation
//! (what `Connection::proxy_error` reports after a failed attempt).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketError {
    pub kind: SocketErrorKind,
    pub message: String,
    /// Raw OS error code, if an OS call produced the failure.
    pub os_error: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SocketErrorKind {
    /// Operation requires a registered connection and there is none.
    NotRegistered,
    /// Operation requires a closed connection but one is already live.
    AlreadyOpen,
    /// Operation requires an established transport.
    NotConnected,
    /// Local bind failed.
    BindFailed,
    /// Listen setup failed.
    ListenFailed,
    /// TLS configuration or upgrade setup failed.
    TlsFailed,
    /// The reactor has been stopped.
    ReactorStopped,
    /// Config / parameter validation error.
    InvalidConfig,
    /// An I/O error on the transport.
    IoError,
}

pub type SocketResult<T> = Result<T, SocketError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SocketError {
    pub fn new(kind: SocketErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            os_error: None,
        }
    }

    pub fn with_os_error(mut self, code: i32) -> Self {
        self.os_error = Some(code);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn not_registered() -> Self {
        Self::new(SocketErrorKind::NotRegistered, "connection is not registered")
    }

    pub fn already_open() -> Self {
        Self::new(SocketErrorKind::AlreadyOpen, "connection is already open")
    }

    pub fn not_connected() -> Self {
        Self::new(SocketErrorKind::NotConnected, "connection is not established")
    }

    pub fn bind_failed(msg: impl Into<String>) -> Self {
        Self::new(SocketErrorKind::BindFailed, msg)
    }

    pub fn listen_failed(msg: impl Into<String>) -> Self {
        Self::new(SocketErrorKind::ListenFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(SocketErrorKind::TlsFailed, msg)
    }

    pub fn reactor_stopped() -> Self {
        Self::new(SocketErrorKind::ReactorStopped, "reactor has been stopped")
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(SocketErrorKind::InvalidConfig, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(SocketErrorKind::IoError, msg)
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.os_error {
            write!(f, "[Socket {:?} os={}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[Socket {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        let err = Self::io_error(e.to_string());
        match e.raw_os_error() {
            Some(code) => err.with_os_error(code),
            None => err,
        }
    }
}

// ─── Proxy negotiation outcome ───────────────────────────────────────

/// Classification of a failed (or successful) proxy negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProxyErrorKind {
    /// No error — the attempt succeeded.
    None,
    /// Target hostname could not be resolved (SOCKS4 resolves locally).
    HostResolutionFailed,
    /// A handshake message could not be written in full.
    SendFailed,
    /// The proxy closed the connection or the read failed mid-handshake.
    ReceiveFailed,
    /// A reply arrived that does not match the protocol at this phase.
    UnexpectedReply,
    /// The proxy reported a server-side failure code.
    ProxyServerError,
    /// SOCKS5 offered no authentication method we support (no credentials set).
    AuthMethodUnsupported,
    /// SOCKS5 refused username/password although credentials were set.
    PasswordAuthUnsupported,
    /// SOCKS5 username/password login was rejected.
    PasswordAuthRejected,
    /// The TCP connection to the proxy itself failed.
    ProxyConnectFailed,
    /// The proxy kind cannot open listening sockets (HTTP CONNECT).
    ListenUnsupported,
    /// HTTP proxy returned a non-2xx status; `detail` holds the verbatim
    /// first response line.
    HttpProxyError,
}

/// Which stage of the attempt a timeout hit. Drives
/// `Connection::proxy_timeout_description`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TimeoutPhase {
    /// Connecting to the proxy server.
    ProxyConnect,
    /// Mid-negotiation with the proxy.
    Negotiation,
    /// Waiting for the remote side (listen grant received, no accept).
    RemoteConnect,
}

/// Result of one connect/listen attempt through (or past) a proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyOutcome {
    pub kind: ProxyErrorKind,
    /// Raw OS error code where an OS call failed underneath.
    pub os_error: Option<i32>,
    /// Protocol detail: SOCKS reply description, or the verbatim first
    /// line of an HTTP proxy response.
    pub detail: Option<String>,
    /// Set when the attempt was cut short by a timeout.
    pub timed_out: Option<TimeoutPhase>,
}

impl ProxyOutcome {
    pub fn ok() -> Self {
        Self {
            kind: ProxyErrorKind::None,
            os_error: None,
            detail: None,
            timed_out: None,
        }
    }

    pub fn new(kind: ProxyErrorKind) -> Self {
        Self {
            kind,
            os_error: None,
            detail: None,
            timed_out: None,
        }
    }

    pub fn with_os_error(mut self, code: i32) -> Self {
        self.os_error = Some(code);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_timeout(mut self, phase: TimeoutPhase) -> Self {
        self.timed_out = Some(phase);
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind != ProxyErrorKind::None
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn resolution_failed(os_error: Option<i32>) -> Self {
        Self {
            kind: ProxyErrorKind::HostResolutionFailed,
            os_error,
            detail: None,
            timed_out: None,
        }
    }

    pub fn send_failed(os_error: Option<i32>) -> Self {
        Self {
            kind: ProxyErrorKind::SendFailed,
            os_error,
            detail: None,
            timed_out: None,
        }
    }

    pub fn receive_failed(os_error: Option<i32>) -> Self {
        Self {
            kind: ProxyErrorKind::ReceiveFailed,
            os_error,
            detail: None,
            timed_out: None,
        }
    }

    pub fn unexpected_reply() -> Self {
        Self::new(ProxyErrorKind::UnexpectedReply)
    }

    pub fn listen_unsupported() -> Self {
        Self::new(ProxyErrorKind::ListenUnsupported)
    }

    pub fn proxy_connect_failed(os_error: Option<i32>) -> Self {
        Self {
            kind: ProxyErrorKind::ProxyConnectFailed,
            os_error,
            detail: None,
            timed_out: None,
        }
    }

    /// Server-error outcome from a SOCKS4 reply code.
    pub fn socks4_server_error(code: u8) -> Self {
        Self::new(ProxyErrorKind::ProxyServerError).with_detail(socks4_reply_description(code))
    }

    /// Server-error outcome from a SOCKS5 reply code.
    pub fn socks5_server_error(code: u8) -> Self {
        Self::new(ProxyErrorKind::ProxyServerError).with_detail(socks5_reply_description(code))
    }

    pub fn http_error(first_line: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::HttpProxyError).with_detail(first_line)
    }

    /// Human-readable summary of the failure, or `None` on success.
    pub fn describe(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        let base = match self.kind {
            ProxyErrorKind::None => unreachable!(),
            ProxyErrorKind::HostResolutionFailed => "host name resolution failed",
            ProxyErrorKind::SendFailed => "sending a request to the proxy server failed",
            ProxyErrorKind::ReceiveFailed => "reading a reply from the proxy server failed",
            ProxyErrorKind::UnexpectedReply => "the proxy server sent an unexpected reply",
            ProxyErrorKind::ProxyServerError => "the proxy server reported an error",
            ProxyErrorKind::AuthMethodUnsupported => {
                "the proxy server accepts no authentication method we support"
            }
            ProxyErrorKind::PasswordAuthUnsupported => {
                "the proxy server does not accept username/password authentication"
            }
            ProxyErrorKind::PasswordAuthRejected => {
                "the proxy server rejected the username/password login"
            }
            ProxyErrorKind::ProxyConnectFailed => "connecting to the proxy server failed",
            ProxyErrorKind::ListenUnsupported => {
                "the proxy does not support listening sockets"
            }
            ProxyErrorKind::HttpProxyError => "the HTTP proxy refused the request",
        };
        let mut out = base.to_string();
        if let Some(detail) = &self.detail {
            out.push_str(": ");
            out.push_str(detail);
        }
        if let Some(code) = self.os_error {
            out.push_str(&format!(" (OS error {})", code));
        }
        Some(out)
    }

    /// Describes which stage a timeout hit, or `None` if no timeout was
    /// involved.
    pub fn timeout_description(&self) -> Option<&'static str> {
        match self.timed_out? {
            TimeoutPhase::ProxyConnect => Some("timed out connecting to the proxy server"),
            TimeoutPhase::Negotiation => Some("timed out negotiating with the proxy server"),
            TimeoutPhase::RemoteConnect => {
                Some("timed out waiting for the remote side to connect")
            }
        }
    }
}

/// SOCKS4 reply-code text (CD field of the 8-byte reply).
pub fn socks4_reply_description(code: u8) -> String {
    match code {
        90 => "request granted".to_string(),
        92 => "the SOCKS server cannot reach the client's identd".to_string(),
        93 => "identd reported a different user-id".to_string(),
        _ => "request rejected or failed".to_string(),
    }
}

/// SOCKS5 reply-code text (REP field, RFC 1928 §6).
pub fn socks5_reply_description(code: u8) -> String {
    match code {
        0 => "succeeded".to_string(),
        2 => "connection not allowed by ruleset".to_string(),
        3 => "network unreachable".to_string(),
        4 => "host unreachable".to_string(),
        5 => "connection refused".to_string(),
        6 => "TTL expired".to_string(),
        7 => "command not supported".to_string(),
        8 => "address type not supported".to_string(),
        _ => "general SOCKS server failure".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_outcome_describes_nothing() {
        assert!(ProxyOutcome::ok().describe().is_none());
        assert!(!ProxyOutcome::ok().is_error());
    }

    #[test]
    fn socks5_codes_have_specific_text() {
        let o = ProxyOutcome::socks5_server_error(5);
        assert_eq!(o.kind, ProxyErrorKind::ProxyServerError);
        assert!(o.describe().unwrap().contains("connection refused"));
        let o = ProxyOutcome::socks5_server_error(1);
        assert!(o.describe().unwrap().contains("general SOCKS server failure"));
    }

    #[test]
    fn socks4_identd_codes() {
        assert!(socks4_reply_description(92).contains("identd"));
        assert!(socks4_reply_description(93).contains("different user-id"));
        assert!(socks4_reply_description(91).contains("rejected"));
    }

    #[test]
    fn http_outcome_keeps_first_line() {
        let o = ProxyOutcome::http_error("HTTP/1.1 407 Proxy Authentication Required");
        assert!(o.describe().unwrap().contains("407 Proxy Authentication Required"));
    }

    #[test]
    fn timeout_phase_description() {
        let o = ProxyOutcome::new(ProxyErrorKind::ReceiveFailed)
            .with_timeout(TimeoutPhase::Negotiation);
        assert!(o.timeout_description().unwrap().contains("negotiating"));
        assert!(ProxyOutcome::ok().timeout_description().is_none());
    }
}
