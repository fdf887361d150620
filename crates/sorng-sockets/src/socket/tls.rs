//! In-place TLS upgrade of an established transport.
//!
//! The reactor drives a rustls `ClientConnection` directly from socket
//! readiness (no async wrapper stream). Certificate validation uses the
//! native root store; when the caller opted in, an unverifiable peer
//! certificate is captured and handed back through `TlsEstablished`
//! instead of failing the handshake, so the owner makes the trust
//! decision. Reusing a paired connection's `TlsContext` shares its
//! client config and thus its session-resumption cache (FTP servers
//! commonly require data connections to resume the control session).

use crate::socket::error::{SocketError, SocketResult};
use crate::socket::types::UntrustedCert;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, HandshakeKind, RootCertStore, SignatureScheme};
use std::io;
use std::sync::{Arc, Mutex};

/// Per-upgrade parameters.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Name presented for SNI and certificate validation.
    pub server_name: String,
    /// Capture an unverifiable certificate for the owner instead of
    /// failing the handshake.
    pub accept_untrusted: bool,
}

/// Shareable TLS client state. Pass a connection's context to a paired
/// connection's `encrypt_in_place` to share the resumption cache.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    captured: Arc<Mutex<Option<UntrustedCert>>>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn new(accept_untrusted: bool) -> SocketResult<Self> {
        let captured = Arc::new(Mutex::new(None));
        let mut roots = RootCertStore::empty();
        let loaded = rustls_native_certs::load_native_certs();
        if !loaded.errors.is_empty() {
            log::warn!(
                "native root store: {} certificate(s) failed to load",
                loaded.errors.len()
            );
        }
        for cert in loaded.certs {
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            return Err(SocketError::tls_failed("no usable native root certificates"));
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| SocketError::tls_failed(format!("verifier setup: {}", e)))?;
        let verifier = CapturingVerifier {
            inner,
            accept_untrusted,
            captured: captured.clone(),
        };
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| SocketError::tls_failed(format!("protocol setup: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        config.resumption = Resumption::in_memory_sessions(32);
        Ok(Self {
            config: Arc::new(config),
            captured,
        })
    }
}

/// One in-flight (or completed) TLS session over a transport the
/// reactor owns.
pub struct TlsSession {
    conn: ClientConnection,
    context: TlsContext,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

impl TlsSession {
    /// `reuse` shares the paired connection's config (and resumption
    /// cache); otherwise a fresh context is built from `settings`.
    pub fn new(settings: &TlsSettings, reuse: Option<TlsContext>) -> SocketResult<Self> {
        let context = match reuse {
            Some(ctx) => ctx,
            None => TlsContext::new(settings.accept_untrusted)?,
        };
        // A previous handshake on a shared context may have left a
        // capture behind.
        if let Ok(mut slot) = context.captured.lock() {
            *slot = None;
        }
        let name = ServerName::try_from(settings.server_name.clone())
            .map_err(|e| SocketError::tls_failed(format!("bad server name: {}", e)))?;
        let conn = ClientConnection::new(context.config.clone(), name)
            .map_err(|e| SocketError::tls_failed(format!("session setup: {}", e)))?;
        Ok(Self { conn, context })
    }

    pub fn context(&self) -> TlsContext {
        self.context.clone()
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Whether the completed handshake resumed an earlier session.
    pub fn session_reused(&self) -> bool {
        self.conn.handshake_kind() == Some(HandshakeKind::Resumed)
    }

    /// The capture left by the verifier, if validation failed and the
    /// context allows proceeding anyway.
    pub fn take_untrusted_cert(&self) -> Option<UntrustedCert> {
        self.context.captured.lock().ok()?.take()
    }

    /// Pulls TLS records from the transport and processes them.
    /// `Ok(0)` means the peer closed cleanly.
    pub fn read_records(&mut self, io: &mut dyn io::Read) -> io::Result<usize> {
        let n = self.conn.read_tls(io)?;
        self.conn
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(n)
    }

    /// Flushes pending TLS records to the transport.
    pub fn write_records(&mut self, io: &mut dyn io::Write) -> io::Result<usize> {
        let mut total = 0;
        while self.conn.wants_write() {
            total += self.conn.write_tls(io)?;
        }
        Ok(total)
    }

    /// Queues plaintext for encryption. `write_records` must follow to
    /// put it on the wire.
    pub fn send_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        use io::Write as _;
        self.conn.writer().write(buf)
    }

    /// Decrypted bytes ready for the owner.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use io::Read as _;
        self.conn.reader().read(buf)
    }

    /// Queues the close_notify alert for a graceful TLS shutdown.
    pub fn queue_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}

#[derive(Debug)]
struct CapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    accept_untrusted: bool,
    captured: Arc<Mutex<Option<UntrustedCert>>>,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(err) if self.accept_untrusted => {
                log::debug!("certificate validation failed, deferring to owner: {}", err);
                if let Ok(mut slot) = self.captured.lock() {
                    *slot = Some(UntrustedCert {
                        der: end_entity.as_ref().to_vec(),
                        reason: err.to_string(),
                    });
                }
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
