//! # sorng-sockets — Proxy-Aware Socket Engine
//!
//! Non-blocking TCP connections, directly or tunnelled through SOCKS4,
//! SOCKS4A, SOCKS5, or HTTP/1.1 CONNECT proxies, with listen support
//! over SOCKS BIND, cross-thread timers and messaging, and in-place
//! TLS upgrade with session reuse.
//!
//! Architecture:
//! - `types` — data structures, enums, config, events
//! - `error` — engine errors and the proxy-outcome taxonomy
//! - `codec` — pure SOCKS4/4A/5 and HTTP CONNECT wire codec
//! - `machine` — per-connection negotiation state machine
//! - `timer` — deadline-ordered timer queue, FIFO ties
//! - `registry` — generation-counted slot map with UID index
//! - `resolver` — async hostname resolution
//! - `tls` — rustls-based in-place transport encryption
//! - `reactor` — the event loop: readiness, mailboxes, timers
//! - `connection` — the public per-connection handle

pub mod codec;
pub mod connection;
pub mod error;
pub mod machine;
pub mod reactor;
pub mod registry;
pub mod resolver;
pub mod timer;
pub mod tls;
pub mod types;

// Re-exports for lib.rs consumers
pub use connection::{Connection, EventReceiver, PROBE_THROTTLE};
pub use error::{
    ProxyErrorKind, ProxyOutcome, SocketError, SocketErrorKind, SocketResult, TimeoutPhase,
};
pub use reactor::{Reactor, RESERVED_TIMER_BASE};
pub use tls::{TlsContext, TlsSettings};
pub use types::{
    EngineConfig, ProxyConfig, ProxyKind, SlotHandle, SocketEvent, SocketState, TargetHost, Uid,
    UntrustedCert,
};
