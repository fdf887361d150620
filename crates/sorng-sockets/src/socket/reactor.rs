//! The socket engine's event loop.
//!
//! One `Reactor` owns a registry of connection slots, a timer queue,
//! and two cross-thread mailboxes (posted messages and resolution
//! results). A single spawned driver task multiplexes socket readiness,
//! in-flight TCP connects, timer deadlines, and mailbox arrivals; it is
//! the only context that advances a connection's protocol state. Caller
//! threads mutate the shared structures under the engine lock and wake
//! the driver through a `Notify`.

use crate::socket::error::{ProxyOutcome, SocketError, SocketResult};
use crate::socket::machine::{Action, Input, NegotiationMode, Negotiator, ReadHint};
use crate::socket::registry::Registry;
use crate::socket::resolver;
use crate::socket::timer::TimerQueue;
use crate::socket::tls::{TlsContext, TlsSession, TlsSettings};
use crate::socket::types::{
    EngineConfig, SlotHandle, SocketEvent, SocketState, Uid, DATA_RCVBUF_SIZE, DATA_SNDBUF_SIZE,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

/// Timer ids at or above this value belong to the engine; owner-facing
/// `schedule_timer` rejects them.
pub const RESERVED_TIMER_BASE: u32 = 0xFFFF_FF00;
/// Covers the current handshake phase (connect, negotiation, grant).
const TIMER_HANDSHAKE: u32 = 0xFFFF_FF01;
/// Graceful-shutdown deadline.
const TIMER_SHUTDOWN: u32 = 0xFFFF_FF02;
/// Resolution request id used by the negotiation machine itself.
const RESOLVE_INTERNAL: u32 = u32::MAX;

type ConnectFuture = Pin<Box<dyn Future<Output = (u64, io::Result<TcpStream>)> + Send>>;

// ─── Connection-side shared state ────────────────────────────────────

/// State a `Connection` handle reads without going through the driver.
#[derive(Debug)]
pub(crate) struct ConnShared {
    pub uid: Uid,
    pub handle: Mutex<Option<SlotHandle>>,
    pub connected: AtomicBool,
    pub state: Mutex<SocketState>,
    pub outcome: Mutex<ProxyOutcome>,
    pub last_probe: Mutex<Option<Instant>>,
}

impl ConnShared {
    fn new(uid: Uid) -> Self {
        Self {
            uid,
            handle: Mutex::new(None),
            connected: AtomicBool::new(false),
            state: Mutex::new(SocketState::Closed),
            outcome: Mutex::new(ProxyOutcome::ok()),
            last_probe: Mutex::new(None),
        }
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn set_outcome(&self, outcome: ProxyOutcome) {
        *lock(&self.outcome) = outcome;
    }
}

/// Poison recovery: the engine lock only guards plain data, a panicked
/// holder leaves nothing half-initialised worth dying over.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Registry entries ────────────────────────────────────────────────

#[derive(Debug)]
enum Transport {
    None,
    /// OS connect in flight, identified in the connect future set.
    Connecting { tid: u64 },
    Stream(TcpStream),
    /// Bound synchronously on the caller thread, promoted by the driver.
    PendingListener(Option<std::net::TcpListener>),
    Listener(TcpListener),
}

#[derive(Debug)]
struct Entry {
    uid: Uid,
    transport: Transport,
    state: SocketState,
    mode: NegotiationMode,
    negotiator: Option<Negotiator>,
    tls: Option<TlsSession>,
    events: UnboundedSender<SocketEvent>,
    conn: Arc<ConnShared>,
    /// Readable readiness is polled only while armed; `recv` re-arms.
    read_armed: bool,
    /// Writable readiness is polled after a short `send`.
    write_armed: bool,
    pending_shutdown: bool,
    /// `recv` saw EOF; the driver performs the close transition.
    eof: bool,
    // Readiness observed by the poll pass, consumed by the next
    // process pass.
    ready_read: bool,
    ready_write: bool,
    accepted: Option<io::Result<(TcpStream, SocketAddr)>>,
    /// Inbound bytes drained by the driver during shutdown.
    rx_backlog: Vec<u8>,
}

impl Entry {
    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SocketState) {
        self.state = state;
        self.conn.set_state(state);
    }

    fn wants_read(&self) -> bool {
        match self.state {
            SocketState::Negotiating | SocketState::ShuttingDown => true,
            SocketState::TlsHandshake => self.tls.as_ref().is_some_and(|t| t.wants_read()),
            SocketState::Established => self.read_armed,
            _ => false,
        }
    }

    fn wants_write(&self) -> bool {
        match self.state {
            SocketState::TlsHandshake => self.tls.as_ref().is_some_and(|t| t.wants_write()),
            SocketState::Established => {
                self.write_armed || self.tls.as_ref().is_some_and(|t| t.wants_write())
            }
            _ => false,
        }
    }
}

// ─── Shared engine state ─────────────────────────────────────────────

struct Posted {
    uid: Uid,
    id: u32,
    param: u64,
}

struct Resolution {
    uid: Uid,
    request_id: u32,
    result: Result<Ipv4Addr, Option<i32>>,
}

struct Shared {
    registry: Registry<Entry>,
    timers: TimerQueue,
    posts: VecDeque<Posted>,
    resolutions: VecDeque<Resolution>,
    /// Owner-requested resolutions; the driver spawns the lookups so
    /// callers need no runtime context.
    resolve_requests: VecDeque<(Uid, u32, String)>,
    connects: FuturesUnordered<ConnectFuture>,
    connect_done: Vec<(u64, io::Result<TcpStream>)>,
}

struct Inner {
    shared: Mutex<Shared>,
    notify: Notify,
    config: EngineConfig,
    next_uid: AtomicU64,
    next_tid: AtomicU64,
    running: AtomicBool,
}

/// Cloneable handle to one engine instance.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Spawns the driver task. Must be called within a tokio runtime.
    pub fn start(config: EngineConfig) -> Reactor {
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                registry: Registry::new(),
                timers: TimerQueue::new(),
                posts: VecDeque::new(),
                resolutions: VecDeque::new(),
                resolve_requests: VecDeque::new(),
                connects: FuturesUnordered::new(),
                connect_done: Vec::new(),
            }),
            notify: Notify::new(),
            config,
            next_uid: AtomicU64::new(1),
            next_tid: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });
        tokio::spawn(drive(inner.clone()));
        Reactor { inner }
    }

    /// Stops the driver and closes every registered transport.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        self.inner.notify.notify_one();
    }

    // ── Registration ─────────────────────────────────────────────

    /// Allocates a slot and a fresh UID. The receiver carries every
    /// event the engine emits for this connection.
    pub(crate) fn register_entry(
        &self,
    ) -> SocketResult<(Arc<ConnShared>, UnboundedReceiver<SocketEvent>)> {
        if !self.is_running() {
            return Err(SocketError::reactor_stopped());
        }
        let uid = self.inner.next_uid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnShared::new(uid));
        let entry = Entry {
            uid,
            transport: Transport::None,
            state: SocketState::Closed,
            mode: NegotiationMode::Connect,
            negotiator: None,
            tls: None,
            events: tx,
            conn: conn.clone(),
            read_armed: false,
            write_armed: false,
            pending_shutdown: false,
            eof: false,
            ready_read: false,
            ready_write: false,
            accepted: None,
            rx_backlog: Vec::new(),
        };
        let mut shared = lock(&self.inner.shared);
        let handle = shared.registry.register(uid, entry);
        *lock(&conn.handle) = Some(handle);
        log::debug!("registered connection uid={} slot={}", uid, handle.index);
        Ok((conn, rx))
    }

    pub(crate) fn deregister(&self, uid: Uid) {
        let mut shared = lock(&self.inner.shared);
        if let Some(handle) = shared.registry.handle_of(uid) {
            shared.timers.cancel_all(uid);
            if let Some(entry) = shared.registry.deregister(handle) {
                *lock(&entry.conn.handle) = None;
                entry.conn.connected.store(false, Ordering::SeqCst);
            }
            log::debug!("deregistered connection uid={}", uid);
        }
        drop(shared);
        self.wake();
    }

    // ── Opening connections ──────────────────────────────────────

    /// Starts a non-blocking connect, optionally through a proxy. The
    /// outcome arrives as `Connected`/`ConnectFailed` (or the
    /// `Accepted`/`AcceptFailed` family when `mode` is `Listen`).
    pub(crate) fn connect(
        &self,
        uid: Uid,
        addr: SocketAddrV4,
        negotiator: Option<Negotiator>,
        mode: NegotiationMode,
    ) -> SocketResult<()> {
        let tid = self.inner.next_tid.fetch_add(1, Ordering::Relaxed);
        let data_buffers = self.inner.config.data_connection_buffers;
        let mut shared = lock(&self.inner.shared);
        let Shared { registry, timers, connects, .. } = &mut *shared;
        let entry = registry.get_by_uid_mut(uid).ok_or_else(SocketError::not_registered)?;
        if !matches!(entry.state, SocketState::Closed | SocketState::Failed) {
            return Err(SocketError::already_open());
        }
        entry.mode = mode;
        entry.negotiator = negotiator;
        entry.tls = None;
        entry.rx_backlog.clear();
        entry.eof = false;
        entry.transport = Transport::Connecting { tid };
        entry.set_state(SocketState::Connecting);
        entry.conn.set_outcome(ProxyOutcome::ok());
        timers.cancel(uid, TIMER_HANDSHAKE);
        timers.schedule(
            uid,
            TIMER_HANDSHAKE,
            Instant::now() + self.inner.config.connect_timeout(),
            0,
        );
        connects.push(Box::pin(async move {
            (tid, connect_stream(addr, data_buffers).await)
        }));
        drop(shared);
        self.wake();
        Ok(())
    }

    /// Binds a local listener synchronously and hands it to the driver.
    /// Returns the actual bound address (`port` 0 picks a free one).
    pub(crate) fn listen(
        &self,
        uid: Uid,
        bind_ip: Ipv4Addr,
        port: u16,
    ) -> SocketResult<(Ipv4Addr, u16)> {
        let listener = std::net::TcpListener::bind(SocketAddrV4::new(bind_ip, port))
            .map_err(|e| annotate_os(SocketError::bind_failed(e.to_string()), &e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| annotate_os(SocketError::listen_failed(e.to_string()), &e))?;
        let local = match listener.local_addr() {
            Ok(SocketAddr::V4(v4)) => (*v4.ip(), v4.port()),
            Ok(SocketAddr::V6(_)) => (bind_ip, port),
            Err(e) => return Err(annotate_os(SocketError::listen_failed(e.to_string()), &e)),
        };
        let mut shared = lock(&self.inner.shared);
        let entry = shared
            .registry
            .get_by_uid_mut(uid)
            .ok_or_else(SocketError::not_registered)?;
        if !matches!(entry.state, SocketState::Closed | SocketState::Failed) {
            return Err(SocketError::already_open());
        }
        entry.mode = NegotiationMode::Listen;
        entry.negotiator = None;
        entry.transport = Transport::PendingListener(Some(listener));
        entry.set_state(SocketState::Listening);
        entry.conn.set_outcome(ProxyOutcome::ok());
        drop(shared);
        self.wake();
        Ok(local)
    }

    /// Asks the proxy for a listening socket. The granted public
    /// address arrives as `ListenGranted`; the eventual inbound
    /// connection as `Accepted`. Proxy kinds that cannot listen fail
    /// here, before any network I/O.
    pub(crate) fn listen_via_proxy(
        &self,
        uid: Uid,
        proxy_addr: SocketAddrV4,
        negotiator: Result<Negotiator, ProxyOutcome>,
    ) -> SocketResult<()> {
        let negotiator = match negotiator {
            Ok(n) => n,
            Err(outcome) => {
                let shared = lock(&self.inner.shared);
                if let Some(entry) = shared.registry.get_by_uid(uid) {
                    entry.conn.set_outcome(outcome.clone());
                }
                let msg = outcome
                    .describe()
                    .unwrap_or_else(|| "listen rejected".to_string());
                return Err(SocketError::listen_failed(msg));
            }
        };
        self.connect(uid, proxy_addr, Some(negotiator), NegotiationMode::Listen)
    }

    // ── Established-transport operations ─────────────────────────

    /// Begins the TLS upgrade. Completion arrives as `TlsEstablished`
    /// or `TlsFailed`.
    pub(crate) fn encrypt_in_place(
        &self,
        uid: Uid,
        settings: &TlsSettings,
        reuse: Option<TlsContext>,
    ) -> SocketResult<()> {
        let mut session = TlsSession::new(settings, reuse)?;
        let mut shared = lock(&self.inner.shared);
        let entry = shared
            .registry
            .get_by_uid_mut(uid)
            .ok_or_else(SocketError::not_registered)?;
        if entry.state != SocketState::Established {
            return Err(SocketError::not_connected());
        }
        if entry.tls.is_some() {
            return Err(SocketError::tls_failed("transport is already encrypted"));
        }
        // First flight goes out immediately; the driver takes over on
        // readiness from here.
        if let Transport::Stream(stream) = &entry.transport {
            let mut io = StreamIo(stream);
            if let Err(e) = session.write_records(&mut io) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    return Err(SocketError::tls_failed(e.to_string()));
                }
            }
        } else {
            return Err(SocketError::not_connected());
        }
        entry.tls = Some(session);
        entry.set_state(SocketState::TlsHandshake);
        drop(shared);
        self.wake();
        Ok(())
    }

    /// The TLS context of an established encrypted connection, for
    /// session reuse on a paired connection.
    pub(crate) fn tls_context(&self, uid: Uid) -> Option<TlsContext> {
        let shared = lock(&self.inner.shared);
        shared
            .registry
            .get_by_uid(uid)
            .and_then(|e| e.tls.as_ref())
            .map(|t| t.context())
    }

    /// Graceful half-close. The driver sends close_notify (when TLS is
    /// active) and shuts down the write side; `ShutdownTimeout` fires
    /// if the peer never closes.
    pub(crate) fn shutdown(&self, uid: Uid) -> SocketResult<()> {
        let mut shared = lock(&self.inner.shared);
        let Shared { registry, timers, .. } = &mut *shared;
        let entry = registry.get_by_uid_mut(uid).ok_or_else(SocketError::not_registered)?;
        if entry.state != SocketState::Established {
            return Err(SocketError::not_connected());
        }
        entry.pending_shutdown = true;
        entry.set_state(SocketState::ShuttingDown);
        timers.schedule(
            uid,
            TIMER_SHUTDOWN,
            Instant::now() + self.inner.config.shutdown_timeout(),
            0,
        );
        drop(shared);
        self.wake();
        Ok(())
    }

    /// Hard close: drops the transport and every pending timer. The
    /// slot stays registered.
    pub(crate) fn close(&self, uid: Uid) -> SocketResult<()> {
        let mut shared = lock(&self.inner.shared);
        let Shared { registry, timers, .. } = &mut *shared;
        let entry = registry.get_by_uid_mut(uid).ok_or_else(SocketError::not_registered)?;
        timers.cancel_all(uid);
        entry.transport = Transport::None;
        entry.negotiator = None;
        entry.tls = None;
        entry.rx_backlog.clear();
        entry.pending_shutdown = false;
        entry.eof = false;
        entry.read_armed = false;
        entry.write_armed = false;
        entry.set_state(SocketState::Closed);
        entry.conn.connected.store(false, Ordering::SeqCst);
        drop(shared);
        self.wake();
        Ok(())
    }

    /// Non-blocking send on the established transport. May accept
    /// fewer bytes than offered; a `Writable` event follows once the
    /// transport drains.
    pub(crate) fn send(&self, uid: Uid, buf: &[u8]) -> SocketResult<usize> {
        let mut shared = lock(&self.inner.shared);
        let entry = shared
            .registry
            .get_by_uid_mut(uid)
            .ok_or_else(SocketError::not_registered)?;
        if entry.state != SocketState::Established {
            return Err(SocketError::not_connected());
        }
        let Entry { transport, tls, write_armed, .. } = entry;
        let stream = match transport {
            Transport::Stream(s) => s,
            _ => return Err(SocketError::not_connected()),
        };
        let result = match tls {
            Some(session) => {
                let n = session.send_plaintext(buf).map_err(SocketError::from)?;
                let mut io = StreamIo(stream);
                match session.write_records(&mut io) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        *write_armed = true;
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(n)
            }
            None => match stream.try_write(buf) {
                Ok(n) => {
                    if n < buf.len() {
                        *write_armed = true;
                    }
                    Ok(n)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    *write_armed = true;
                    Ok(0)
                }
                Err(e) => Err(e.into()),
            },
        };
        let armed = *write_armed;
        drop(shared);
        if armed {
            self.wake();
        }
        result
    }

    /// Non-blocking receive. An empty result means no data yet (a
    /// `Readable` event follows) or, after a `Closed` event, EOF.
    pub(crate) fn recv(&self, uid: Uid, max: usize) -> SocketResult<Vec<u8>> {
        let mut shared = lock(&self.inner.shared);
        let entry = shared
            .registry
            .get_by_uid_mut(uid)
            .ok_or_else(SocketError::not_registered)?;
        if !matches!(entry.state, SocketState::Established | SocketState::ShuttingDown) {
            return Err(SocketError::not_connected());
        }
        if !entry.rx_backlog.is_empty() {
            let n = entry.rx_backlog.len().min(max);
            let out: Vec<u8> = entry.rx_backlog.drain(..n).collect();
            return Ok(out);
        }
        let Entry { transport, tls, read_armed, eof, .. } = entry;
        let stream = match transport {
            Transport::Stream(s) => s,
            _ => return Err(SocketError::not_connected()),
        };
        let had_tls = tls.is_some();
        let mut out = vec![0u8; max];
        let read = match tls {
            Some(session) => {
                let mut io = StreamIo(stream);
                match session.read_records(&mut io) {
                    Ok(0) => {
                        *eof = true;
                        Ok(0)
                    }
                    Ok(_) => session.read_plaintext(&mut out),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        session.read_plaintext(&mut out)
                    }
                    Err(e) => Err(e),
                }
            }
            None => stream.try_read(&mut out),
        };
        let result = match read {
            Ok(0) if !had_tls => {
                *eof = true;
                Ok(Vec::new())
            }
            Ok(0) => Ok(Vec::new()),
            Ok(n) => {
                out.truncate(n);
                Ok(out)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(SocketError::from(e)),
        };
        *read_armed = true;
        drop(shared);
        self.wake();
        result
    }

    pub(crate) fn local_addr(&self, uid: Uid) -> SocketResult<SocketAddr> {
        let shared = lock(&self.inner.shared);
        let entry = shared
            .registry
            .get_by_uid(uid)
            .ok_or_else(SocketError::not_registered)?;
        let addr = match &entry.transport {
            Transport::Stream(s) => s.local_addr(),
            Transport::Listener(l) => l.local_addr(),
            Transport::PendingListener(Some(l)) => l.local_addr(),
            _ => return Err(SocketError::not_connected()),
        };
        addr.map_err(SocketError::from)
    }

    // ── Timers, messages, resolution ─────────────────────────────

    /// `false` when the connection is gone or the id is reserved.
    pub fn schedule_timer(&self, uid: Uid, id: u32, delay: Duration, param: u64) -> bool {
        if id >= RESERVED_TIMER_BASE {
            return false;
        }
        let mut shared = lock(&self.inner.shared);
        if shared.registry.handle_of(uid).is_none() {
            return false;
        }
        shared.timers.schedule(uid, id, Instant::now() + delay, param);
        drop(shared);
        self.wake();
        true
    }

    /// Removes every pending `(uid, id)` timer. `false` if none existed.
    pub fn cancel_timer(&self, uid: Uid, id: u32) -> bool {
        if id >= RESERVED_TIMER_BASE {
            return false;
        }
        let mut shared = lock(&self.inner.shared);
        shared.timers.cancel(uid, id)
    }

    /// Queues a message for FIFO delivery on the driver task. `false`
    /// when the UID is no longer registered.
    pub fn post_message(&self, uid: Uid, id: u32, param: u64) -> bool {
        let mut shared = lock(&self.inner.shared);
        if shared.registry.handle_of(uid).is_none() {
            return false;
        }
        shared.posts.push_back(Posted { uid, id, param });
        drop(shared);
        self.wake();
        true
    }

    /// Starts an async hostname resolution; the result arrives as
    /// `HostResolved` tagged with `request_id`.
    pub fn resolve_host_async(&self, uid: Uid, request_id: u32, name: impl Into<String>) -> bool {
        if request_id == RESOLVE_INTERNAL {
            return false;
        }
        let mut shared = lock(&self.inner.shared);
        if shared.registry.handle_of(uid).is_none() {
            return false;
        }
        shared.resolve_requests.push_back((uid, request_id, name.into()));
        drop(shared);
        self.wake();
        true
    }

    /// `(exists, connected)` for a UID; stale UIDs report
    /// `(false, false)`.
    pub fn is_connected(&self, uid: Uid) -> (bool, bool) {
        let shared = lock(&self.inner.shared);
        match shared.registry.get_by_uid(uid) {
            Some(entry) => (true, entry.conn.connected.load(Ordering::SeqCst)),
            None => (false, false),
        }
    }

    /// Atomically exchanges the transports and slot handles of two
    /// connections. UIDs, event channels, and protocol context stay
    /// with their owners; in-flight messages resolve against the
    /// post-swap mapping.
    pub fn swap(&self, a: Uid, b: Uid) -> bool {
        let mut shared = lock(&self.inner.shared);
        let registry = &mut shared.registry;
        if !registry.swap_slots(a, b) {
            return false;
        }
        // swap_slots moved each UID's whole entry to the other slot;
        // trade the transport-bound pieces back so each owner ends up
        // with the peer's transport.
        let (ha, hb) = match (registry.handle_of(a), registry.handle_of(b)) {
            (Some(ha), Some(hb)) => (ha, hb),
            _ => return false,
        };
        swap_transports(registry, ha, hb);
        for uid in [a, b] {
            if let Some(entry) = registry.get_by_uid(uid) {
                *lock(&entry.conn.handle) = registry.handle_of(uid);
            }
        }
        drop(shared);
        self.wake();
        true
    }
}

/// Swaps the transport-bound fields between two live slots.
fn swap_transports(registry: &mut Registry<Entry>, ha: SlotHandle, hb: SlotHandle) {
    if ha == hb {
        return;
    }
    // Take both entries' transport fields through a two-step dance:
    // pull A's pieces out, swap with B's, put the rest back.
    let take = |e: &mut Entry| {
        (
            std::mem::replace(&mut e.transport, Transport::None),
            e.tls.take(),
            e.read_armed,
            e.write_armed,
            std::mem::take(&mut e.rx_backlog),
            e.conn.connected.load(Ordering::SeqCst),
        )
    };
    let from_a = match registry.get_mut(ha) {
        Some(a) => take(a),
        None => return,
    };
    let from_b = match registry.get_mut(hb) {
        Some(b) => {
            let taken = take(b);
            b.transport = from_a.0;
            b.tls = from_a.1;
            b.read_armed = from_a.2;
            b.write_armed = from_a.3;
            b.rx_backlog = from_a.4;
            b.conn.connected.store(from_a.5, Ordering::SeqCst);
            taken
        }
        None => return,
    };
    if let Some(a) = registry.get_mut(ha) {
        a.transport = from_b.0;
        a.tls = from_b.1;
        a.read_armed = from_b.2;
        a.write_armed = from_b.3;
        a.rx_backlog = from_b.4;
        a.conn.connected.store(from_b.5, Ordering::SeqCst);
    }
}

fn annotate_os(err: SocketError, io_err: &io::Error) -> SocketError {
    match io_err.raw_os_error() {
        Some(code) => err.with_os_error(code),
        None => err,
    }
}

async fn connect_stream(addr: SocketAddrV4, data_buffers: bool) -> io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    if data_buffers {
        socket.set_send_buffer_size(DATA_SNDBUF_SIZE as u32)?;
        socket.set_recv_buffer_size(DATA_RCVBUF_SIZE as u32)?;
    }
    let stream = socket.connect(SocketAddr::V4(addr)).await?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// `io::Read`/`io::Write` over a tokio stream's non-blocking try_ ops,
/// for driving rustls from readiness.
struct StreamIo<'a>(&'a TcpStream);

impl io::Read for StreamIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl io::Write for StreamIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ─── Driver task ─────────────────────────────────────────────────────

async fn drive(inner: Arc<Inner>) {
    log::debug!("socket engine driver started");
    loop {
        let next_deadline = process(&inner);
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        let mut sleep = next_deadline
            .map(|d| Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(d))));
        futures::future::poll_fn(|cx| {
            if notified.as_mut().poll(cx).is_ready() {
                return Poll::Ready(());
            }
            if let Some(s) = sleep.as_mut() {
                if s.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            let mut shared = lock(&inner.shared);
            if poll_sources(&mut shared, cx) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
    }
    // Drop every transport on the way out.
    let mut shared = lock(&inner.shared);
    let uids: Vec<Uid> = shared.registry.iter_mut().map(|(_, uid, _)| uid).collect();
    for uid in uids {
        if let Some(handle) = shared.registry.handle_of(uid) {
            if let Some(entry) = shared.registry.deregister(handle) {
                *lock(&entry.conn.handle) = None;
                entry.conn.connected.store(false, Ordering::SeqCst);
            }
        }
    }
    log::debug!("socket engine driver stopped");
}

/// Observes readiness without acting on it; results are stashed on the
/// entries (or in `connect_done`) for the next `process` pass.
fn poll_sources(shared: &mut Shared, cx: &mut Context<'_>) -> bool {
    let mut progress = false;
    loop {
        match shared.connects.poll_next_unpin(cx) {
            Poll::Ready(Some(done)) => {
                shared.connect_done.push(done);
                progress = true;
            }
            Poll::Ready(None) | Poll::Pending => break,
        }
    }
    for (_, _, entry) in shared.registry.iter_mut() {
        let want_read = entry.wants_read() && !entry.ready_read;
        let want_write = entry.wants_write() && !entry.ready_write;
        let Entry { transport, ready_read, ready_write, accepted, .. } = entry;
        match transport {
            Transport::Stream(stream) => {
                if want_read && stream.poll_read_ready(cx).is_ready() {
                    *ready_read = true;
                    progress = true;
                }
                if want_write && stream.poll_write_ready(cx).is_ready() {
                    *ready_write = true;
                    progress = true;
                }
            }
            Transport::Listener(listener) => {
                if accepted.is_none() {
                    if let Poll::Ready(result) = listener.poll_accept(cx) {
                        *accepted = Some(result);
                        progress = true;
                    }
                }
            }
            // Promoted by process(); count as progress so it runs.
            Transport::PendingListener(_) => progress = true,
            _ => {}
        }
    }
    progress
}

/// One housekeeping pass: drains mailboxes, finished connects, stashed
/// readiness, and due timers. Returns the next timer deadline.
fn process(inner: &Arc<Inner>) -> Option<Instant> {
    let mut shared = lock(&inner.shared);
    let config = inner.config.clone();
    let Shared {
        registry,
        timers,
        posts,
        resolutions,
        resolve_requests,
        connect_done,
        ..
    } = &mut *shared;

    // Finished OS connects.
    for (tid, result) in connect_done.drain(..) {
        let found = registry.iter_mut().find(|(_, _, e)| {
            matches!(e.transport, Transport::Connecting { tid: t } if t == tid)
        });
        let (_, uid, entry) = match found {
            Some(hit) => hit,
            // Closed or swapped away while connecting; drop the stream.
            None => continue,
        };
        match result {
            Ok(stream) => {
                entry.transport = Transport::Stream(stream);
                if entry.negotiator.is_some() {
                    entry.set_state(SocketState::Negotiating);
                    timers.cancel(uid, TIMER_HANDSHAKE);
                    timers.schedule(
                        uid,
                        TIMER_HANDSHAKE,
                        Instant::now() + config.negotiation_timeout(),
                        0,
                    );
                    step_machine(entry, timers, inner, Input::ProxyConnected, &config);
                } else {
                    establish(entry, timers, uid, None);
                }
            }
            Err(e) => {
                let os = e.raw_os_error();
                if entry.negotiator.is_some() {
                    step_machine(
                        entry,
                        timers,
                        inner,
                        Input::ProxyConnectFailed { os_error: os },
                        &config,
                    );
                } else {
                    fail_entry(entry, timers, uid, ProxyOutcome::proxy_connect_failed(os));
                }
            }
        }
    }

    // Promote listeners bound on caller threads.
    for (_, uid, entry) in registry.iter_mut() {
        if let Transport::PendingListener(slot) = &mut entry.transport {
            if let Some(std_listener) = slot.take() {
                match TcpListener::from_std(std_listener) {
                    Ok(listener) => entry.transport = Transport::Listener(listener),
                    Err(e) => {
                        let outcome = ProxyOutcome::receive_failed(e.raw_os_error());
                        fail_entry(entry, timers, uid, outcome);
                    }
                }
            }
        }
    }

    // Accepted inbound connections.
    for (_, uid, entry) in registry.iter_mut() {
        if let Some(result) = entry.accepted.take() {
            match result {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    // One accept per listen; the listener is done.
                    entry.transport = Transport::Stream(stream);
                    establish(entry, timers, uid, Some(peer));
                }
                Err(e) => {
                    log::warn!("accept failed on uid={}: {}", uid, e);
                    entry.emit(SocketEvent::AcceptFailed(ProxyOutcome::receive_failed(
                        e.raw_os_error(),
                    )));
                }
            }
        }
    }

    // Stashed stream readiness.
    for (_, uid, entry) in registry.iter_mut() {
        if entry.eof {
            entry.eof = false;
            close_on_peer(entry, timers, uid, None);
            continue;
        }
        if entry.ready_read {
            entry.ready_read = false;
            handle_readable(entry, timers, inner, uid, &config);
        }
        if entry.ready_write {
            entry.ready_write = false;
            handle_writable(entry, timers, uid);
        }
        if entry.pending_shutdown {
            entry.pending_shutdown = false;
            perform_shutdown(entry, timers, uid);
        }
    }

    // Posted messages (FIFO, stale UIDs dropped).
    while let Some(Posted { uid, id, param }) = posts.pop_front() {
        match registry.get_by_uid(uid) {
            Some(entry) => entry.emit(SocketEvent::Message { id, param }),
            None => log::debug!("dropping message for stale uid={}", uid),
        }
    }

    // Owner-requested resolutions: spawn the lookups here so callers
    // need no runtime context.
    while let Some((uid, request_id, name)) = resolve_requests.pop_front() {
        spawn_resolution(inner, uid, request_id, name);
    }

    // Finished resolutions.
    while let Some(Resolution { uid, request_id, result }) = resolutions.pop_front() {
        let entry = match registry.get_by_uid_mut(uid) {
            Some(e) => e,
            None => continue,
        };
        if request_id == RESOLVE_INTERNAL {
            if entry.negotiator.is_some() {
                let input = match result {
                    Ok(ip) => Input::Resolved(ip),
                    Err(os_error) => Input::ResolveFailed { os_error },
                };
                step_machine(entry, timers, inner, input, &config);
            }
        } else {
            let (ip, os_error) = match result {
                Ok(ip) => (Some(ip), None),
                Err(os) => (None, os),
            };
            entry.emit(SocketEvent::HostResolved { request_id, ip, os_error });
        }
    }

    // Due timers, from a snapshot so handlers may reschedule freely.
    let due = timers.take_due(Instant::now());
    for timer in due {
        let entry = match registry.get_by_uid_mut(timer.owner) {
            Some(e) => e,
            None => continue,
        };
        match timer.id {
            TIMER_HANDSHAKE => {
                if entry.negotiator.is_some() {
                    step_machine(entry, timers, inner, Input::TimedOut, &config);
                } else if entry.state == SocketState::Connecting {
                    let outcome = ProxyOutcome::proxy_connect_failed(None)
                        .with_timeout(crate::socket::error::TimeoutPhase::ProxyConnect);
                    fail_entry(entry, timers, timer.owner, outcome);
                }
            }
            TIMER_SHUTDOWN => {
                if entry.state == SocketState::ShuttingDown {
                    entry.emit(SocketEvent::ShutdownTimeout);
                }
            }
            id => entry.emit(SocketEvent::Timer { id, param: timer.param }),
        }
    }

    timers.next_deadline()
}

// ─── Per-entry transitions (driver task only) ────────────────────────

fn step_machine(
    entry: &mut Entry,
    timers: &mut TimerQueue,
    inner: &Arc<Inner>,
    input: Input<'_>,
    config: &EngineConfig,
) {
    let uid = entry.uid;
    let actions = match entry.negotiator.as_mut() {
        Some(n) => n.on_input(input),
        None => return,
    };
    for action in actions {
        match action {
            Action::Send(bytes) => {
                if let Err(outcome) = write_all_now(entry, &bytes) {
                    fail_entry(entry, timers, uid, outcome);
                    return;
                }
            }
            Action::Resolve(name) => {
                spawn_resolution(inner, uid, RESOLVE_INTERNAL, name);
            }
            Action::Established => {
                entry.negotiator = None;
                establish(entry, timers, uid, None);
                return;
            }
            Action::ListenGranted { ip, port } => {
                entry.emit(SocketEvent::ListenGranted { ip, port });
                timers.cancel(uid, TIMER_HANDSHAKE);
                timers.schedule(
                    uid,
                    TIMER_HANDSHAKE,
                    Instant::now() + config.remote_accept_timeout(),
                    0,
                );
            }
            Action::RemoteAccepted => {
                entry.negotiator = None;
                let peer = match &entry.transport {
                    Transport::Stream(s) => s.peer_addr().ok(),
                    _ => None,
                };
                establish(entry, timers, uid, Some(unwrap_peer(peer)));
                return;
            }
            Action::Fail(outcome) => {
                fail_entry(entry, timers, uid, outcome);
                return;
            }
        }
    }
}

fn unwrap_peer(peer: Option<SocketAddr>) -> SocketAddr {
    peer.unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
}

/// Handshake messages are small; anything the kernel will not take in
/// one piece counts as a send failure, like the original engine.
fn write_all_now(entry: &Entry, bytes: &[u8]) -> Result<(), ProxyOutcome> {
    let stream = match &entry.transport {
        Transport::Stream(s) => s,
        _ => return Err(ProxyOutcome::send_failed(None)),
    };
    match stream.try_write(bytes) {
        Ok(n) if n == bytes.len() => Ok(()),
        Ok(_) => Err(ProxyOutcome::send_failed(None)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ProxyOutcome::send_failed(None)),
        Err(e) => Err(ProxyOutcome::send_failed(e.raw_os_error())),
    }
}

fn establish(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid, peer: Option<SocketAddr>) {
    timers.cancel(uid, TIMER_HANDSHAKE);
    entry.set_state(SocketState::Established);
    entry.conn.connected.store(true, Ordering::SeqCst);
    entry.conn.set_outcome(ProxyOutcome::ok());
    entry.read_armed = true;
    match (entry.mode, peer) {
        (NegotiationMode::Listen, peer) => {
            entry.emit(SocketEvent::Accepted { peer: unwrap_peer(peer) });
        }
        (NegotiationMode::Connect, _) => entry.emit(SocketEvent::Connected),
    }
    // A freshly established transport is writable; the owner gets one
    // notification without arming.
    entry.emit(SocketEvent::Writable);
    log::debug!("uid={} established", uid);
}

fn fail_entry(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid, outcome: ProxyOutcome) {
    timers.cancel(uid, TIMER_HANDSHAKE);
    entry.transport = Transport::None;
    entry.negotiator = None;
    entry.tls = None;
    entry.set_state(SocketState::Failed);
    entry.conn.connected.store(false, Ordering::SeqCst);
    entry.conn.set_outcome(outcome.clone());
    if let Some(descr) = outcome.describe() {
        log::debug!("uid={} attempt failed: {}", uid, descr);
    }
    match entry.mode {
        NegotiationMode::Connect => entry.emit(SocketEvent::ConnectFailed(outcome)),
        NegotiationMode::Listen => entry.emit(SocketEvent::AcceptFailed(outcome)),
    }
}

fn close_on_peer(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid, os_error: Option<i32>) {
    timers.cancel_all(uid);
    entry.transport = Transport::None;
    entry.tls = None;
    entry.set_state(SocketState::Closed);
    entry.conn.connected.store(false, Ordering::SeqCst);
    entry.emit(SocketEvent::Closed { os_error });
    log::debug!("uid={} closed by peer", uid);
}

fn handle_readable(
    entry: &mut Entry,
    timers: &mut TimerQueue,
    inner: &Arc<Inner>,
    uid: Uid,
    config: &EngineConfig,
) {
    match entry.state {
        SocketState::Negotiating => drive_negotiation_reads(entry, timers, inner, config),
        SocketState::TlsHandshake => drive_tls(entry, timers, uid),
        SocketState::Established => {
            entry.read_armed = false;
            entry.emit(SocketEvent::Readable);
        }
        SocketState::ShuttingDown => drain_during_shutdown(entry, timers, uid),
        _ => {}
    }
}

fn handle_writable(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid) {
    match entry.state {
        SocketState::TlsHandshake => {
            if let (Some(session), Transport::Stream(stream)) =
                (entry.tls.as_mut(), &entry.transport)
            {
                let mut io = StreamIo(stream);
                match session.write_records(&mut io) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        tls_fail(entry, timers, uid, e.to_string());
                        return;
                    }
                }
            }
            finish_tls_if_done(entry, uid);
        }
        SocketState::Established => {
            let mut flushed = true;
            if let (Some(session), Transport::Stream(stream)) =
                (entry.tls.as_mut(), &entry.transport)
            {
                let mut io = StreamIo(stream);
                match session.write_records(&mut io) {
                    Ok(_) => flushed = !session.wants_write(),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => flushed = false,
                    Err(e) => {
                        log::debug!("uid={} write flush failed: {}", uid, e);
                        flushed = false;
                    }
                }
            }
            if entry.write_armed && flushed {
                entry.write_armed = false;
                entry.emit(SocketEvent::Writable);
            }
        }
        _ => {}
    }
}

/// Reads exactly as much as the machine's current phase allows and
/// feeds it through, so a proxy reply is never over-read into tunnel
/// payload.
fn drive_negotiation_reads(
    entry: &mut Entry,
    timers: &mut TimerQueue,
    inner: &Arc<Inner>,
    config: &EngineConfig,
) {
    loop {
        let hint = match entry.negotiator.as_ref() {
            Some(n) => n.read_hint(),
            None => return,
        };
        let budget = match hint {
            ReadHint::Exact(n) => n,
            ReadHint::Byte => 1,
            ReadHint::None => return,
        };
        let mut buf = vec![0u8; budget.max(1)];
        let read = match &entry.transport {
            Transport::Stream(stream) => stream.try_read(&mut buf),
            _ => return,
        };
        match read {
            Ok(0) => {
                step_machine(entry, timers, inner, Input::Closed { os_error: None }, config);
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                step_machine(entry, timers, inner, Input::Data(&buf), config);
                if entry.state != SocketState::Negotiating {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                let os = e.raw_os_error();
                step_machine(entry, timers, inner, Input::Closed { os_error: os }, config);
                return;
            }
        }
    }
}

fn drive_tls(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid) {
    let result = {
        let (session, stream) = match (entry.tls.as_mut(), &entry.transport) {
            (Some(s), Transport::Stream(t)) => (s, t),
            _ => return,
        };
        let mut io = StreamIo(stream);
        let read = session.read_records(&mut io);
        // Flush whatever the handshake wants to say back.
        let mut io = StreamIo(stream);
        match session.write_records(&mut io) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tls_fail(entry, timers, uid, e.to_string());
                return;
            }
        }
        read
    };
    match result {
        Ok(0) => {
            tls_fail(entry, timers, uid, "peer closed during TLS handshake".to_string());
        }
        Ok(_) => finish_tls_if_done(entry, uid),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => finish_tls_if_done(entry, uid),
        Err(e) => tls_fail(entry, timers, uid, e.to_string()),
    }
}

fn finish_tls_if_done(entry: &mut Entry, uid: Uid) {
    let done = entry.tls.as_ref().is_some_and(|t| !t.is_handshaking());
    if !done || entry.state != SocketState::TlsHandshake {
        return;
    }
    let (session_reused, untrusted_cert) = match entry.tls.as_ref() {
        Some(t) => (t.session_reused(), t.take_untrusted_cert()),
        None => return,
    };
    entry.set_state(SocketState::Established);
    entry.read_armed = true;
    log::debug!(
        "uid={} TLS established (resumed={}, untrusted={})",
        uid,
        session_reused,
        untrusted_cert.is_some()
    );
    entry.emit(SocketEvent::TlsEstablished { session_reused, untrusted_cert });
}

fn tls_fail(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid, message: String) {
    timers.cancel_all(uid);
    entry.transport = Transport::None;
    entry.tls = None;
    entry.set_state(SocketState::Failed);
    entry.conn.connected.store(false, Ordering::SeqCst);
    log::debug!("uid={} TLS upgrade failed: {}", uid, message);
    entry.emit(SocketEvent::TlsFailed { message });
}

fn perform_shutdown(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid) {
    if let Some(session) = entry.tls.as_mut() {
        session.queue_close_notify();
        if let Transport::Stream(stream) = &entry.transport {
            let mut io = StreamIo(stream);
            let _ = session.write_records(&mut io);
        }
    }
    // Half-close the write side; the peer's close arrives as EOF.
    let transport = std::mem::replace(&mut entry.transport, Transport::None);
    entry.transport = match transport {
        Transport::Stream(stream) => match stream.into_std() {
            Ok(std_stream) => {
                let _ = std_stream.shutdown(std::net::Shutdown::Write);
                match TcpStream::from_std(std_stream) {
                    Ok(stream) => Transport::Stream(stream),
                    Err(e) => {
                        close_on_peer(entry, timers, uid, e.raw_os_error());
                        return;
                    }
                }
            }
            Err(e) => {
                close_on_peer(entry, timers, uid, e.raw_os_error());
                return;
            }
        },
        other => other,
    };
}

/// During shutdown the driver keeps draining the socket itself: data is
/// buffered for `recv`, EOF completes the close.
fn drain_during_shutdown(entry: &mut Entry, timers: &mut TimerQueue, uid: Uid) {
    let mut scratch = [0u8; 4096];
    loop {
        let read = match &entry.transport {
            Transport::Stream(stream) => stream.try_read(&mut scratch),
            _ => return,
        };
        match read {
            Ok(0) => {
                timers.cancel(uid, TIMER_SHUTDOWN);
                close_on_peer(entry, timers, uid, None);
                return;
            }
            Ok(n) => {
                entry.rx_backlog.extend_from_slice(&scratch[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                timers.cancel(uid, TIMER_SHUTDOWN);
                close_on_peer(entry, timers, uid, e.raw_os_error());
                return;
            }
        }
    }
    if !entry.rx_backlog.is_empty() {
        entry.emit(SocketEvent::Readable);
    }
}

fn spawn_resolution(inner: &Arc<Inner>, uid: Uid, request_id: u32, name: String) {
    let inner = inner.clone();
    tokio::spawn(async move {
        let result = resolver::resolve_ipv4(&name)
            .await
            .map_err(|e| e.raw_os_error());
        let mut shared = lock(&inner.shared);
        shared.resolutions.push_back(Resolution { uid, request_id, result });
        drop(shared);
        inner.notify.notify_one();
    });
}
