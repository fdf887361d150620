//! Proxy-aware non-blocking TCP connection engine.
//!
//! See the [`socket`] module for the architecture overview.

pub mod socket;

pub use socket::{
    Connection, EngineConfig, EventReceiver, ProxyConfig, ProxyErrorKind, ProxyKind, ProxyOutcome,
    Reactor, SlotHandle, SocketError, SocketErrorKind, SocketEvent, SocketResult, SocketState,
    TargetHost, TimeoutPhase, TlsContext, TlsSettings, Uid, UntrustedCert,
};
