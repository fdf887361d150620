//! Public connection handle.
//!
//! A `Connection` owns one registered slot in a `Reactor`. All opening
//! operations return immediately; results arrive on the event receiver
//! handed out at registration. The handle is safe to use from any
//! thread; the reactor's driver task performs every protocol-state
//! transition.

use crate::socket::error::{ProxyOutcome, SocketError, SocketResult};
use crate::socket::machine::{NegotiationMode, Negotiator};
use crate::socket::reactor::{lock, ConnShared, Reactor};
use crate::socket::tls::TlsSettings;
use crate::socket::types::{ProxyConfig, SlotHandle, SocketEvent, SocketState, Uid};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

/// Receiver for a connection's `SocketEvent`s.
pub type EventReceiver = UnboundedReceiver<SocketEvent>;

/// Liveness probes are rate-limited to one per interval; a faster
/// caller is made to wait out the remainder.
pub const PROBE_THROTTLE: Duration = Duration::from_millis(100);

impl Reactor {
    /// Registers a new connection. The receiver carries every event
    /// the engine emits for it.
    pub fn register(&self) -> SocketResult<(Connection, EventReceiver)> {
        let (conn, rx) = self.register_entry()?;
        Ok((
            Connection {
                reactor: self.clone(),
                conn,
            },
            rx,
        ))
    }
}

/// Handle to one registered connection. Dropping it deregisters the
/// slot and closes any live transport.
#[derive(Debug)]
pub struct Connection {
    reactor: Reactor,
    conn: Arc<ConnShared>,
}

impl Connection {
    pub fn uid(&self) -> Uid {
        self.conn.uid
    }

    /// Current registry slot, `None` once deregistered.
    pub fn handle(&self) -> Option<SlotHandle> {
        *lock(&self.conn.handle)
    }

    pub fn state(&self) -> SocketState {
        *lock(&self.conn.state)
    }

    // ── Opening ──────────────────────────────────────────────────

    /// Direct non-blocking connect. Completion arrives as `Connected`
    /// or `ConnectFailed`.
    pub fn connect(&self, ip: Ipv4Addr, port: u16) -> SocketResult<()> {
        self.reactor.connect(
            self.uid(),
            SocketAddrV4::new(ip, port),
            None,
            NegotiationMode::Connect,
        )
    }

    /// Connect to `cfg.target_host:target_port` through the configured
    /// proxy. Completion arrives as `Connected` or `ConnectFailed`.
    pub fn connect_via_proxy(&self, cfg: ProxyConfig) -> SocketResult<()> {
        let proxy_addr = SocketAddrV4::new(cfg.proxy_ip, cfg.proxy_port);
        let negotiator = match Negotiator::new(cfg, NegotiationMode::Connect) {
            Ok(n) => n,
            Err(outcome) => {
                self.conn.set_outcome(outcome.clone());
                let msg = outcome
                    .describe()
                    .unwrap_or_else(|| "connect rejected".to_string());
                return Err(SocketError::invalid_config(msg));
            }
        };
        self.reactor
            .connect(self.uid(), proxy_addr, Some(negotiator), NegotiationMode::Connect)
    }

    /// Binds a local listener and returns the actual address (`port` 0
    /// picks any free one). The first inbound connection arrives as
    /// `Accepted` and replaces the listener.
    pub fn listen(&self, bind_ip: Ipv4Addr, port: u16) -> SocketResult<(Ipv4Addr, u16)> {
        self.reactor.listen(self.uid(), bind_ip, port)
    }

    /// Asks the proxy to open a listening socket toward
    /// `cfg.target_host`. The granted public address arrives as
    /// `ListenGranted`, the eventual peer as `Accepted`. Fails
    /// immediately, with no network I/O, for proxy kinds that cannot
    /// listen (HTTP CONNECT).
    pub fn listen_via_proxy(&self, cfg: ProxyConfig) -> SocketResult<()> {
        let proxy_addr = SocketAddrV4::new(cfg.proxy_ip, cfg.proxy_port);
        let negotiator = Negotiator::new(cfg, NegotiationMode::Listen);
        self.reactor
            .listen_via_proxy(self.uid(), proxy_addr, negotiator)
    }

    // ── Established-transport operations ─────────────────────────

    /// Upgrades the established transport to TLS in place. Completion
    /// arrives as `TlsEstablished` (possibly carrying an untrusted
    /// certificate for the owner's trust decision) or `TlsFailed`.
    /// Pass the paired control connection in `reuse_from` to share its
    /// TLS session cache; the completion event reports whether the
    /// handshake actually resumed.
    pub fn encrypt_in_place(
        &self,
        settings: &TlsSettings,
        reuse_from: Option<&Connection>,
    ) -> SocketResult<()> {
        let context = reuse_from.and_then(|peer| self.reactor.tls_context(peer.uid()));
        self.reactor.encrypt_in_place(self.uid(), settings, context)
    }

    /// Graceful half-close: stops writes and waits for the peer's
    /// close (`Closed` event). If the peer never closes,
    /// `ShutdownTimeout` tells the owner to `close` hard.
    pub fn shutdown(&self) -> SocketResult<()> {
        self.reactor.shutdown(self.uid())
    }

    /// Hard close. Drops the transport and all pending timers; the
    /// slot stays registered for reuse.
    pub fn close(&self) -> SocketResult<()> {
        self.reactor.close(self.uid())
    }

    /// Non-blocking send. Accepts fewer bytes than offered when the
    /// transport is full; `Writable` follows once it drains.
    pub fn send(&self, buf: &[u8]) -> SocketResult<usize> {
        self.reactor.send(self.uid(), buf)
    }

    /// Non-blocking receive of up to `max` bytes. Empty means no data
    /// yet; `Readable` follows when more arrives.
    pub fn recv(&self, max: usize) -> SocketResult<Vec<u8>> {
        self.reactor.recv(self.uid(), max)
    }

    pub fn local_addr(&self) -> SocketResult<SocketAddr> {
        self.reactor.local_addr(self.uid())
    }

    // ── Timers, messages, resolution ─────────────────────────────

    /// Schedules a timer delivered as `Timer { id, param }`. Reserved
    /// ids are rejected. Equal deadlines fire in scheduling order.
    pub fn schedule_timer(&self, id: u32, delay: Duration, param: u64) -> bool {
        self.reactor.schedule_timer(self.uid(), id, delay, param)
    }

    /// Cancels every pending timer with this id.
    pub fn cancel_timer(&self, id: u32) -> bool {
        self.reactor.cancel_timer(self.uid(), id)
    }

    /// Posts a message to this connection's owner from any thread,
    /// delivered FIFO as `Message { id, param }`.
    pub fn post_message(&self, id: u32, param: u64) -> bool {
        self.reactor.post_message(self.uid(), id, param)
    }

    /// Resolves a hostname off-thread; the result arrives as
    /// `HostResolved` tagged with `request_id`.
    pub fn resolve_host_async(&self, request_id: u32, name: impl Into<String>) -> bool {
        self.reactor.resolve_host_async(self.uid(), request_id, name)
    }

    // ── Diagnostics ──────────────────────────────────────────────

    /// Throttled liveness probe.
    pub fn is_connected(&self) -> bool {
        let wait = {
            let last = lock(&self.conn.last_probe);
            last.map(|prev| {
                let elapsed = Instant::now().duration_since(prev);
                PROBE_THROTTLE.saturating_sub(elapsed)
            })
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }
        *lock(&self.conn.last_probe) = Some(Instant::now());
        self.reactor.is_connected(self.uid()).1
    }

    /// The classified result of the last connect/listen attempt.
    pub fn proxy_outcome(&self) -> ProxyOutcome {
        lock(&self.conn.outcome).clone()
    }

    /// Human-readable failure summary, `None` after a success.
    pub fn proxy_error(&self) -> Option<String> {
        self.proxy_outcome().describe()
    }

    /// Which stage a timeout hit, `None` if the last attempt did not
    /// time out.
    pub fn proxy_timeout_description(&self) -> Option<&'static str> {
        lock(&self.conn.outcome).timeout_description()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reactor.deregister(self.conn.uid);
    }
}
