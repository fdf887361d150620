//! Proxy negotiation state machine.
//!
//! One `Negotiator` drives one handshake. It is pure: the reactor feeds
//! it inputs (connect results, received bytes, timeouts) and executes
//! the actions it returns (send bytes, resolve a name, report the
//! result). `read_hint` tells the reactor exactly how much it may read,
//! so a reply is never over-read into the tunnel that follows it.

use crate::socket::codec;
use crate::socket::codec::{Socks5Addr, SocksCommand};
use crate::socket::error::{ProxyOutcome, TimeoutPhase};
use crate::socket::types::{ProxyConfig, ProxyKind};
use std::net::Ipv4Addr;

/// Whether this handshake opens an outbound tunnel or a proxy-side
/// listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationMode {
    Connect,
    Listen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// TCP connect to the proxy in flight.
    ConnectingToProxy,
    /// SOCKS4 only: resolving the target locally before the request.
    ResolvingTarget,
    /// SOCKS4/4A CONNECT reply pending.
    AwaitingConnectReply,
    /// SOCKS5 method-selection reply pending.
    AwaitingMethodChoice,
    /// SOCKS5 username/password reply pending.
    AwaitingLoginReply,
    /// SOCKS5 CONNECT reply pending.
    AwaitingRequestReply,
    /// HTTP CONNECT response headers pending.
    AwaitingStatusLine,
    /// BIND first reply (the grant with the public address) pending.
    AwaitingListenGrant,
    /// BIND second reply (remote peer connected) pending.
    AwaitingRemoteAccept,
    Established,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Established | Phase::Failed)
    }
}

/// What the reactor may read while waiting in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHint {
    /// Nothing expected from the wire.
    None,
    /// Read at most this many further bytes.
    Exact(usize),
    /// Read one byte at a time (HTTP headers).
    Byte,
}

#[derive(Debug)]
pub enum Input<'a> {
    /// The TCP connection to the proxy completed.
    ProxyConnected,
    /// The TCP connection to the proxy failed.
    ProxyConnectFailed { os_error: Option<i32> },
    /// Bytes received from the proxy.
    Data(&'a [u8]),
    /// The proxy closed the connection (or the read failed).
    Closed { os_error: Option<i32> },
    /// Local resolution requested by an earlier `Resolve` action.
    Resolved(Ipv4Addr),
    ResolveFailed { os_error: Option<i32> },
    /// The phase timer fired.
    TimedOut,
}

#[derive(Debug, PartialEq)]
pub enum Action {
    /// Write these bytes to the proxy.
    Send(Vec<u8>),
    /// Resolve this hostname off-thread and feed the result back.
    Resolve(String),
    /// The tunnel is up; the connection is established.
    Established,
    /// The proxy granted the listen at this public address.
    ListenGranted { ip: Ipv4Addr, port: u16 },
    /// The remote peer connected through the granted listen.
    RemoteAccepted,
    /// The attempt failed.
    Fail(ProxyOutcome),
}

#[derive(Debug)]
pub struct Negotiator {
    cfg: ProxyConfig,
    mode: NegotiationMode,
    phase: Phase,
    /// Reply bytes accumulated for the current phase.
    buf: Vec<u8>,
    http: codec::HttpReplyParser,
}

impl Negotiator {
    /// Fails immediately (without any I/O) when the proxy kind cannot
    /// serve the requested mode.
    pub fn new(cfg: ProxyConfig, mode: NegotiationMode) -> Result<Self, ProxyOutcome> {
        if mode == NegotiationMode::Listen && cfg.kind == ProxyKind::HttpConnect {
            return Err(ProxyOutcome::listen_unsupported());
        }
        Ok(Self {
            cfg,
            mode,
            phase: Phase::ConnectingToProxy,
            buf: Vec::new(),
            http: codec::HttpReplyParser::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mode(&self) -> NegotiationMode {
        self.mode
    }

    /// Which timeout stage a timer expiry in the current phase maps to.
    pub fn timeout_phase(&self) -> TimeoutPhase {
        match self.phase {
            Phase::ConnectingToProxy => TimeoutPhase::ProxyConnect,
            Phase::AwaitingRemoteAccept => TimeoutPhase::RemoteConnect,
            _ => TimeoutPhase::Negotiation,
        }
    }

    pub fn read_hint(&self) -> ReadHint {
        match self.phase {
            Phase::AwaitingConnectReply => {
                ReadHint::Exact(codec::SOCKS4_REPLY_LEN - self.buf.len())
            }
            Phase::AwaitingListenGrant | Phase::AwaitingRemoteAccept => {
                let len = match self.cfg.kind {
                    ProxyKind::Socks5 => codec::SOCKS5_REPLY_LEN,
                    _ => codec::SOCKS4_REPLY_LEN,
                };
                ReadHint::Exact(len - self.buf.len())
            }
            Phase::AwaitingMethodChoice => {
                ReadHint::Exact(codec::SOCKS5_METHOD_REPLY_LEN - self.buf.len())
            }
            Phase::AwaitingLoginReply => {
                ReadHint::Exact(codec::SOCKS5_LOGIN_REPLY_LEN - self.buf.len())
            }
            Phase::AwaitingRequestReply => {
                ReadHint::Exact(codec::SOCKS5_REPLY_LEN - self.buf.len())
            }
            Phase::AwaitingStatusLine => ReadHint::Byte,
            _ => ReadHint::None,
        }
    }

    pub fn on_input(&mut self, input: Input<'_>) -> Vec<Action> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        match input {
            Input::ProxyConnected => self.on_proxy_connected(),
            Input::ProxyConnectFailed { os_error } => {
                self.fail(ProxyOutcome::proxy_connect_failed(os_error))
            }
            Input::Data(bytes) => self.on_data(bytes),
            Input::Closed { os_error } => self.fail(ProxyOutcome::receive_failed(os_error)),
            Input::Resolved(ip) => self.on_resolved(ip),
            Input::ResolveFailed { os_error } => {
                self.fail(ProxyOutcome::resolution_failed(os_error))
            }
            Input::TimedOut => {
                let phase = self.timeout_phase();
                let outcome = match phase {
                    TimeoutPhase::ProxyConnect => ProxyOutcome::proxy_connect_failed(None),
                    _ => ProxyOutcome::receive_failed(None),
                };
                self.fail(outcome.with_timeout(phase))
            }
        }
    }

    // ── Phase handlers ───────────────────────────────────────────

    fn on_proxy_connected(&mut self) -> Vec<Action> {
        if self.phase != Phase::ConnectingToProxy {
            return self.fail(ProxyOutcome::unexpected_reply());
        }
        match self.cfg.kind {
            ProxyKind::Socks4 => match self.cfg.target_ip() {
                Some(ip) => self.send_socks4_request(ip),
                None => {
                    // Plain SOCKS4 needs the IP; resolve locally first.
                    let name = match self.cfg.target_host.as_name() {
                        Some(n) => n.to_string(),
                        None => return self.fail(ProxyOutcome::resolution_failed(None)),
                    };
                    self.phase = Phase::ResolvingTarget;
                    vec![Action::Resolve(name)]
                }
            },
            ProxyKind::Socks4A => {
                let req = match self.cfg.target_ip() {
                    // An IP literal goes out as a plain SOCKS4 request.
                    Some(ip) => codec::socks4_request(
                        self.command(),
                        ip,
                        self.cfg.target_port,
                        self.userid(),
                    ),
                    None => codec::socks4a_request(
                        self.command(),
                        &self.cfg.target_host.to_string(),
                        self.cfg.target_port,
                        self.userid(),
                    ),
                };
                self.phase = self.socks4_reply_phase();
                vec![Action::Send(req)]
            }
            ProxyKind::Socks5 => {
                self.phase = Phase::AwaitingMethodChoice;
                vec![Action::Send(codec::socks5_method_request(
                    self.cfg.has_credentials(),
                ))]
            }
            ProxyKind::HttpConnect => {
                self.phase = Phase::AwaitingStatusLine;
                let req = codec::http_connect_request(
                    &self.cfg.target_host.to_string(),
                    self.cfg.target_port,
                    self.cfg.username.as_deref(),
                    self.cfg.password.as_deref(),
                );
                vec![Action::Send(req.into_bytes())]
            }
        }
    }

    fn on_resolved(&mut self, ip: Ipv4Addr) -> Vec<Action> {
        if self.phase != Phase::ResolvingTarget {
            return Vec::new();
        }
        self.cfg.resolved_ip = Some(ip);
        self.send_socks4_request(ip)
    }

    fn on_data(&mut self, bytes: &[u8]) -> Vec<Action> {
        match self.phase {
            Phase::AwaitingStatusLine => self.on_http_bytes(bytes),
            Phase::AwaitingConnectReply
            | Phase::AwaitingMethodChoice
            | Phase::AwaitingLoginReply
            | Phase::AwaitingRequestReply
            | Phase::AwaitingListenGrant
            | Phase::AwaitingRemoteAccept => {
                let expected = match self.read_hint() {
                    ReadHint::Exact(more) => self.buf.len() + more,
                    _ => return self.fail(ProxyOutcome::unexpected_reply()),
                };
                self.buf.extend_from_slice(bytes);
                if self.buf.len() > expected {
                    return self.fail(ProxyOutcome::unexpected_reply());
                }
                if self.buf.len() < expected {
                    return Vec::new();
                }
                let reply = std::mem::take(&mut self.buf);
                self.on_complete_reply(&reply)
            }
            // Bytes before any request went out are protocol violations.
            _ => self.fail(ProxyOutcome::unexpected_reply()),
        }
    }

    fn on_complete_reply(&mut self, reply: &[u8]) -> Vec<Action> {
        match self.phase {
            Phase::AwaitingConnectReply => match codec::parse_socks4_reply(reply) {
                Some(r) if r.status == codec::SOCKS4_GRANTED => {
                    self.phase = Phase::Established;
                    vec![Action::Established]
                }
                Some(r) => self.fail(ProxyOutcome::socks4_server_error(r.status)),
                None => self.fail(ProxyOutcome::unexpected_reply()),
            },
            Phase::AwaitingMethodChoice => {
                match codec::parse_socks5_method_choice(reply) {
                    Some(codec::SOCKS5_METHOD_NO_AUTH) => self.send_socks5_request(),
                    Some(codec::SOCKS5_METHOD_USERPASS) if self.cfg.has_credentials() => {
                        self.phase = Phase::AwaitingLoginReply;
                        vec![Action::Send(codec::socks5_login_request(
                            self.cfg.username.as_deref().unwrap_or(""),
                            self.cfg.password.as_deref().unwrap_or(""),
                        ))]
                    }
                    // Anything else (incl. 0xFF): a distinct auth error,
                    // depending on whether we had credentials to offer.
                    Some(_) => {
                        let kind = if self.cfg.has_credentials() {
                            crate::socket::error::ProxyErrorKind::PasswordAuthUnsupported
                        } else {
                            crate::socket::error::ProxyErrorKind::AuthMethodUnsupported
                        };
                        self.fail(ProxyOutcome::new(kind))
                    }
                    None => self.fail(ProxyOutcome::unexpected_reply()),
                }
            }
            Phase::AwaitingLoginReply => match codec::parse_socks5_login_status(reply) {
                Some(0) => self.send_socks5_request(),
                Some(_) => self.fail(ProxyOutcome::new(
                    crate::socket::error::ProxyErrorKind::PasswordAuthRejected,
                )),
                None => self.fail(ProxyOutcome::unexpected_reply()),
            },
            Phase::AwaitingRequestReply => match codec::parse_socks5_reply(reply) {
                Some(r) if r.status == codec::SOCKS5_SUCCEEDED => {
                    self.phase = Phase::Established;
                    vec![Action::Established]
                }
                Some(r) => self.fail(ProxyOutcome::socks5_server_error(r.status)),
                None => self.fail(ProxyOutcome::unexpected_reply()),
            },
            Phase::AwaitingListenGrant => {
                let granted = match self.cfg.kind {
                    ProxyKind::Socks5 => codec::parse_socks5_reply(reply).map(|r| {
                        (r.status == codec::SOCKS5_SUCCEEDED, r.ip, r.port, r.status)
                    }),
                    _ => codec::parse_socks4_reply(reply).map(|r| {
                        (r.status == codec::SOCKS4_GRANTED, r.ip, r.port, r.status)
                    }),
                };
                match granted {
                    Some((true, ip, port, _)) => {
                        // An all-zero grant address means "same as the
                        // proxy itself".
                        let ip = if ip.is_unspecified() { self.cfg.proxy_ip } else { ip };
                        self.phase = Phase::AwaitingRemoteAccept;
                        vec![Action::ListenGranted { ip, port }]
                    }
                    Some((false, _, _, status)) => self.fail(self.server_error(status)),
                    None => self.fail(ProxyOutcome::unexpected_reply()),
                }
            }
            Phase::AwaitingRemoteAccept => {
                let ok = match self.cfg.kind {
                    ProxyKind::Socks5 => codec::parse_socks5_reply(reply)
                        .map(|r| (r.status == codec::SOCKS5_SUCCEEDED, r.status)),
                    _ => codec::parse_socks4_reply(reply)
                        .map(|r| (r.status == codec::SOCKS4_GRANTED, r.status)),
                };
                match ok {
                    Some((true, _)) => {
                        self.phase = Phase::Established;
                        vec![Action::RemoteAccepted]
                    }
                    Some((false, status)) => self.fail(self.server_error(status)),
                    None => self.fail(ProxyOutcome::unexpected_reply()),
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_http_bytes(&mut self, bytes: &[u8]) -> Vec<Action> {
        for &b in bytes {
            if self.http.push_byte(b) {
                return if self.http.is_success() {
                    self.phase = Phase::Established;
                    vec![Action::Established]
                } else {
                    let line = self.http.status_line().to_string();
                    self.fail(ProxyOutcome::http_error(line))
                };
            }
        }
        Vec::new()
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn command(&self) -> SocksCommand {
        match self.mode {
            NegotiationMode::Connect => SocksCommand::Connect,
            NegotiationMode::Listen => SocksCommand::Bind,
        }
    }

    fn socks4_reply_phase(&self) -> Phase {
        match self.mode {
            NegotiationMode::Connect => Phase::AwaitingConnectReply,
            NegotiationMode::Listen => Phase::AwaitingListenGrant,
        }
    }

    fn userid(&self) -> &str {
        self.cfg.username.as_deref().unwrap_or("")
    }

    fn send_socks4_request(&mut self, ip: Ipv4Addr) -> Vec<Action> {
        let req = codec::socks4_request(self.command(), ip, self.cfg.target_port, self.userid());
        self.phase = self.socks4_reply_phase();
        vec![Action::Send(req)]
    }

    fn send_socks5_request(&mut self) -> Vec<Action> {
        let addr = match self.cfg.target_ip() {
            Some(ip) => Socks5Addr::Ip(ip),
            None => Socks5Addr::Name(self.cfg.target_host.to_string()),
        };
        let req = codec::socks5_request(self.command(), &addr, self.cfg.target_port);
        self.phase = match self.mode {
            NegotiationMode::Connect => Phase::AwaitingRequestReply,
            NegotiationMode::Listen => Phase::AwaitingListenGrant,
        };
        vec![Action::Send(req)]
    }

    fn server_error(&self, status: u8) -> ProxyOutcome {
        match self.cfg.kind {
            ProxyKind::Socks5 => ProxyOutcome::socks5_server_error(status),
            _ => ProxyOutcome::socks4_server_error(status),
        }
    }

    fn fail(&mut self, outcome: ProxyOutcome) -> Vec<Action> {
        self.phase = Phase::Failed;
        vec![Action::Fail(outcome)]
    }

    #[cfg(test)]
    fn force_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.buf.clear();
    }
}
