//! End-to-end engine tests against in-process fake proxies.

use sorng_sockets::socket::codec;
use sorng_sockets::{
    Connection, EngineConfig, EventReceiver, ProxyConfig, ProxyErrorKind, ProxyKind, Reactor,
    SocketEvent, SocketState, TargetHost, TlsSettings,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::assert_err;

const LOCAL: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

async fn next_event(rx: &mut EventReceiver) -> SocketEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn local_proxy() -> (TcpListener, u16) {
    let listener = TcpListener::bind((LOCAL, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn proxy_cfg(kind: ProxyKind, port: u16) -> ProxyConfig {
    ProxyConfig::new(kind, LOCAL, port).with_target(TargetHost::Ip(Ipv4Addr::new(192, 0, 2, 1)), 21)
}

fn registered(reactor: &Reactor) -> (Connection, EventReceiver) {
    reactor.register().unwrap()
}

/// Reads one SOCKS4 request (8 fixed bytes + NUL-terminated user-id,
/// plus the hostname for SOCKS4A).
async fn read_socks4_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    let mut nuls_wanted = 1 + usize::from(buf[4..8] == [0, 0, 0, 1]);
    while nuls_wanted > 0 {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == 0 {
            nuls_wanted -= 1;
        }
        buf.push(byte[0]);
    }
    buf
}

// ─── SOCKS4 ──────────────────────────────────────────────────────────

#[tokio::test]
async fn socks4_connect_granted_establishes_tunnel() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    let proxy = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let raw = read_socks4_request(&mut stream).await;
        let req = codec::parse_socks4_request(&raw).unwrap();
        assert_eq!(req.cmd, codec::SocksCommand::Connect);
        assert_eq!(req.ip, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(req.port, 21);
        stream
            .write_all(&codec::socks4_reply(codec::SOCKS4_GRANTED, Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
        // Tunnel payload directly after the reply.
        stream.write_all(b"220 ready\r\n").await.unwrap();
        let mut echo = vec![0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"USER");
    });

    let (conn, mut rx) = registered(&reactor);
    conn.connect_via_proxy(proxy_cfg(ProxyKind::Socks4, port)).unwrap();

    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Writable));
    assert!(conn.proxy_error().is_none());
    assert_eq!(conn.state(), SocketState::Established);

    assert!(matches!(next_event(&mut rx).await, SocketEvent::Readable));
    let banner = conn.recv(64).unwrap();
    assert_eq!(&banner, b"220 ready\r\n");

    assert_eq!(conn.send(b"USER").unwrap(), 4);
    proxy.await.unwrap();
    reactor.stop();
}

#[tokio::test]
async fn socks4_rejection_reports_server_error() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_socks4_request(&mut stream).await;
        stream
            .write_all(&codec::socks4_reply(codec::SOCKS4_REJECTED, Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
    });

    let (conn, mut rx) = registered(&reactor);
    conn.connect_via_proxy(proxy_cfg(ProxyKind::Socks4, port)).unwrap();

    match next_event(&mut rx).await {
        SocketEvent::ConnectFailed(outcome) => {
            assert_eq!(outcome.kind, ProxyErrorKind::ProxyServerError);
        }
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
    assert_eq!(conn.state(), SocketState::Failed);
    assert!(conn.proxy_error().unwrap().contains("rejected"));
    reactor.stop();
}

#[tokio::test]
async fn socks4a_forwards_hostname_to_proxy() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    let proxy = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let raw = read_socks4_request(&mut stream).await;
        let req = codec::parse_socks4_request(&raw).unwrap();
        assert_eq!(req.hostname.as_deref(), Some("ftp.example.com"));
        stream
            .write_all(&codec::socks4_reply(codec::SOCKS4_GRANTED, Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
    });

    let (conn, mut rx) = registered(&reactor);
    let cfg = ProxyConfig::new(ProxyKind::Socks4A, LOCAL, port)
        .with_target(TargetHost::Name("ftp.example.com".into()), 21);
    conn.connect_via_proxy(cfg).unwrap();

    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    proxy.await.unwrap();
    reactor.stop();
}

// ─── SOCKS5 ──────────────────────────────────────────────────────────

#[tokio::test]
async fn socks5_userpass_flow_establishes() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    let proxy = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut methods = vec![0u8; 4];
        stream.read_exact(&mut methods).await.unwrap();
        assert_eq!(methods, vec![5, 2, 2, 0]);
        stream.write_all(&[5, 2]).await.unwrap();

        let mut head = vec![0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], codec::SOCKS5_USERPASS_VERSION);
        let mut user = vec![0u8; head[1] as usize];
        stream.read_exact(&mut user).await.unwrap();
        assert_eq!(&user, b"user");
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await.unwrap();
        let mut pass = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut pass).await.unwrap();
        assert_eq!(&pass, b"secret");
        stream.write_all(&[1, 0]).await.unwrap();

        let mut request = vec![0u8; 10];
        stream.read_exact(&mut request).await.unwrap();
        let req = codec::parse_socks5_request(&request).unwrap();
        assert_eq!(req.cmd, codec::SocksCommand::Connect);
        stream
            .write_all(&codec::socks5_reply(codec::SOCKS5_SUCCEEDED, Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
    });

    let (conn, mut rx) = registered(&reactor);
    let cfg = proxy_cfg(ProxyKind::Socks5, port).with_credentials("user", "secret");
    conn.connect_via_proxy(cfg).unwrap();

    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    proxy.await.unwrap();
    reactor.stop();
}

#[tokio::test]
async fn socks5_no_acceptable_method_fails_without_further_bytes() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    let proxy = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut methods = vec![0u8; 3];
        stream.read_exact(&mut methods).await.unwrap();
        assert_eq!(methods, vec![5, 1, 0]);
        stream
            .write_all(&[5, codec::SOCKS5_NO_ACCEPTABLE_METHOD])
            .await
            .unwrap();
        // The client must give up, not send a request.
        let mut rest = Vec::new();
        let n = stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    });

    let (conn, mut rx) = registered(&reactor);
    conn.connect_via_proxy(proxy_cfg(ProxyKind::Socks5, port)).unwrap();

    match next_event(&mut rx).await {
        SocketEvent::ConnectFailed(outcome) => {
            assert_eq!(outcome.kind, ProxyErrorKind::AuthMethodUnsupported);
        }
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
    proxy.await.unwrap();
    reactor.stop();
}

#[tokio::test]
async fn socks4_listen_grant_then_remote_accept() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    let proxy = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let raw = read_socks4_request(&mut stream).await;
        let req = codec::parse_socks4_request(&raw).unwrap();
        assert_eq!(req.cmd, codec::SocksCommand::Bind);
        // Zero grant address: the client must substitute the proxy IP.
        stream
            .write_all(&codec::socks4_reply(codec::SOCKS4_GRANTED, Ipv4Addr::UNSPECIFIED, 20021))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream
            .write_all(&codec::socks4_reply(codec::SOCKS4_GRANTED, Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
    });

    let (conn, mut rx) = registered(&reactor);
    conn.listen_via_proxy(proxy_cfg(ProxyKind::Socks4, port)).unwrap();

    match next_event(&mut rx).await {
        SocketEvent::ListenGranted { ip, port } => {
            assert_eq!(ip, LOCAL);
            assert_eq!(port, 20021);
        }
        other => panic!("expected ListenGranted, got {:?}", other),
    }
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Accepted { .. }));
    assert_eq!(conn.state(), SocketState::Established);
    proxy.await.unwrap();
    reactor.stop();
}

// ─── HTTP CONNECT ────────────────────────────────────────────────────

#[tokio::test]
async fn http_connect_2xx_establishes() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    let proxy = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut req = Vec::new();
        while !req.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            req.push(byte[0]);
        }
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("CONNECT 192.0.2.1:21 HTTP/1.1\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\n")
            .await
            .unwrap();
    });

    let (conn, mut rx) = registered(&reactor);
    conn.connect_via_proxy(proxy_cfg(ProxyKind::HttpConnect, port)).unwrap();

    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    proxy.await.unwrap();
    reactor.stop();
}

#[tokio::test]
async fn http_connect_failure_keeps_verbatim_status_line() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut sink = vec![0u8; 512];
        let _ = stream.read(&mut sink).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
    });

    let (conn, mut rx) = registered(&reactor);
    conn.connect_via_proxy(proxy_cfg(ProxyKind::HttpConnect, port)).unwrap();

    match next_event(&mut rx).await {
        SocketEvent::ConnectFailed(outcome) => {
            assert_eq!(outcome.kind, ProxyErrorKind::HttpProxyError);
            assert_eq!(
                outcome.detail.as_deref(),
                Some("HTTP/1.1 407 Proxy Authentication Required")
            );
        }
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
    assert!(conn
        .proxy_error()
        .unwrap()
        .contains("407 Proxy Authentication Required"));
    reactor.stop();
}

#[tokio::test]
async fn http_listen_fails_fast_without_io() {
    let reactor = Reactor::start(EngineConfig::default());
    let (listener, port) = local_proxy().await;

    let (conn, _rx) = registered(&reactor);
    let err = assert_err!(conn.listen_via_proxy(proxy_cfg(ProxyKind::HttpConnect, port)));
    assert!(err.message.contains("listening"));
    assert_eq!(conn.proxy_outcome().kind, ProxyErrorKind::ListenUnsupported);

    // No connection must ever reach the proxy.
    let touched = tokio::time::timeout(Duration::from_millis(150), listener.accept()).await;
    assert!(touched.is_err());
    reactor.stop();
}

// ─── TLS upgrade ─────────────────────────────────────────────────────

const TLS_CERT_DER: &[u8] = include_bytes!("data/cert.der");
const TLS_KEY_DER: &[u8] = include_bytes!("data/key.der");

fn tls_server_config() -> Arc<rustls::ServerConfig> {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(TLS_CERT_DER.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(TLS_KEY_DER.to_vec())),
        )
        .unwrap();
    Arc::new(config)
}

/// Blocking TLS server for one connection: waits for a 4-byte ping,
/// answers with a greeting.
fn spawn_tls_server(
    listener: std::net::TcpListener,
    config: Arc<rustls::ServerConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        use std::io::{Read, Write};
        let (stream, _) = listener.accept().unwrap();
        let conn = rustls::ServerConnection::new(config).unwrap();
        let mut tls = rustls::StreamOwned::new(conn, stream);
        let mut ping = [0u8; 4];
        tls.read_exact(&mut ping).unwrap();
        assert_eq!(&ping, b"ping");
        tls.write_all(b"secure-hello").unwrap();
    })
}

/// Receives until actual plaintext arrives; a `Readable` may carry only
/// TLS control records (session tickets) that decrypt to nothing.
async fn recv_some(conn: &Connection, rx: &mut EventReceiver) -> Vec<u8> {
    loop {
        assert!(matches!(next_event(rx).await, SocketEvent::Readable));
        let data = conn.recv(64).unwrap();
        if !data.is_empty() {
            return data;
        }
    }
}

async fn established_pair(
    reactor: &Reactor,
    port: u16,
) -> (Connection, EventReceiver) {
    let (conn, mut rx) = registered(reactor);
    conn.connect(LOCAL, port).unwrap();
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Writable));
    (conn, rx)
}

#[tokio::test]
async fn tls_upgrade_captures_self_signed_certificate() {
    let reactor = Reactor::start(EngineConfig::default());
    let listener = std::net::TcpListener::bind((LOCAL, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_tls_server(listener, tls_server_config());

    let (conn, mut rx) = established_pair(&reactor, port).await;
    let settings = TlsSettings {
        server_name: "localhost".into(),
        accept_untrusted: true,
    };
    conn.encrypt_in_place(&settings, None).unwrap();

    match next_event(&mut rx).await {
        SocketEvent::TlsEstablished { session_reused, untrusted_cert } => {
            // A fresh handshake against an unknown server cannot resume.
            assert!(!session_reused);
            let cert = untrusted_cert.expect("self-signed certificate must be captured");
            assert_eq!(cert.der, TLS_CERT_DER);
            assert!(!cert.reason.is_empty());
        }
        other => panic!("expected TlsEstablished, got {:?}", other),
    }
    assert_eq!(conn.state(), SocketState::Established);

    // Plaintext flows through the encrypted transport.
    assert_eq!(conn.send(b"ping").unwrap(), 4);
    assert_eq!(&recv_some(&conn, &mut rx).await, b"secure-hello");
    server.await.unwrap();
    reactor.stop();
}

#[tokio::test]
async fn tls_upgrade_with_shared_context_from_paired_connection() {
    let reactor = Reactor::start(EngineConfig::default());
    let config = tls_server_config();
    let settings = TlsSettings {
        server_name: "localhost".into(),
        accept_untrusted: true,
    };

    let listener = std::net::TcpListener::bind((LOCAL, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_tls_server(listener, config.clone());
    let (control, mut rx_c) = established_pair(&reactor, port).await;
    control.encrypt_in_place(&settings, None).unwrap();
    assert!(matches!(
        next_event(&mut rx_c).await,
        SocketEvent::TlsEstablished { .. }
    ));
    assert_eq!(control.send(b"ping").unwrap(), 4);
    assert_eq!(&recv_some(&control, &mut rx_c).await, b"secure-hello");
    server.await.unwrap();

    // A paired data connection shares the control connection's client
    // config; the capture slot is per-context and must be re-filled.
    let listener = std::net::TcpListener::bind((LOCAL, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_tls_server(listener, config);
    let (data, mut rx_d) = established_pair(&reactor, port).await;
    data.encrypt_in_place(&settings, Some(&control)).unwrap();
    match next_event(&mut rx_d).await {
        SocketEvent::TlsEstablished { session_reused, untrusted_cert } => {
            // A resumed session skips certificate verification; a full
            // handshake must capture the self-signed certificate again.
            if !session_reused {
                assert!(untrusted_cert.is_some());
            }
        }
        other => panic!("expected TlsEstablished, got {:?}", other),
    }
    assert_eq!(data.state(), SocketState::Established);
    assert_eq!(data.send(b"ping").unwrap(), 4);
    assert_eq!(&recv_some(&data, &mut rx_d).await, b"secure-hello");
    server.await.unwrap();
    reactor.stop();
}

// ─── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_half_closes_and_completes_on_peer_eof() {
    let reactor = Reactor::start(EngineConfig::default());
    let (conn, mut rx) = registered(&reactor);

    let listener = TcpListener::bind((LOCAL, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    conn.connect(LOCAL, port).unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Writable));

    conn.shutdown().unwrap();
    assert_eq!(conn.state(), SocketState::ShuttingDown);

    // The peer sees our FIN as EOF, then closes its side.
    let mut buf = [0u8; 8];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    drop(peer);

    assert!(matches!(next_event(&mut rx).await, SocketEvent::Closed { .. }));
    assert_eq!(conn.state(), SocketState::Closed);
    reactor.stop();
}

#[tokio::test]
async fn shutdown_timeout_fires_when_peer_never_closes() {
    let config = EngineConfig {
        shutdown_timeout_sec: 1,
        ..EngineConfig::default()
    };
    let reactor = Reactor::start(config);
    let (conn, mut rx) = registered(&reactor);

    let listener = TcpListener::bind((LOCAL, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    conn.connect(LOCAL, port).unwrap();
    let (_peer, _) = listener.accept().await.unwrap();
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Writable));

    conn.shutdown().unwrap();
    assert!(matches!(next_event(&mut rx).await, SocketEvent::ShutdownTimeout));
    // The transport is still half-open; the owner decides to close hard.
    conn.close().unwrap();
    assert_eq!(conn.state(), SocketState::Closed);
    reactor.stop();
}

// ─── Direct connections ──────────────────────────────────────────────

#[tokio::test]
async fn direct_listen_accepts_inbound_connection() {
    let reactor = Reactor::start(EngineConfig::default());
    let (conn, mut rx) = registered(&reactor);

    let (ip, port) = conn.listen(LOCAL, 0).unwrap();
    assert_eq!(ip, LOCAL);
    assert_ne!(port, 0);

    let mut peer = TcpStream::connect((LOCAL, port)).await.unwrap();
    match next_event(&mut rx).await {
        SocketEvent::Accepted { peer: addr } => assert_eq!(addr.ip(), LOCAL),
        other => panic!("expected Accepted, got {:?}", other),
    }
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Writable));

    peer.write_all(b"hello").await.unwrap();
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Readable));
    assert_eq!(&conn.recv(16).unwrap(), b"hello");
    reactor.stop();
}

#[tokio::test]
async fn direct_connect_refused_fails() {
    let reactor = Reactor::start(EngineConfig::default());
    // Bind-then-drop to get a port nothing listens on.
    let port = {
        let l = std::net::TcpListener::bind((LOCAL, 0)).unwrap();
        l.local_addr().unwrap().port()
    };
    let (conn, mut rx) = registered(&reactor);
    conn.connect(LOCAL, port).unwrap();
    match next_event(&mut rx).await {
        SocketEvent::ConnectFailed(outcome) => {
            assert_eq!(outcome.kind, ProxyErrorKind::ProxyConnectFailed);
            assert!(outcome.os_error.is_some());
        }
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
    reactor.stop();
}

#[tokio::test]
async fn listen_via_proxy_connect_failure_reports_accept_family() {
    let reactor = Reactor::start(EngineConfig::default());
    let port = {
        let l = std::net::TcpListener::bind((LOCAL, 0)).unwrap();
        l.local_addr().unwrap().port()
    };
    let (conn, mut rx) = registered(&reactor);
    conn.listen_via_proxy(proxy_cfg(ProxyKind::Socks4, port)).unwrap();
    // A listen attempt must fail with the accept-side event, never the
    // connect-side one.
    match next_event(&mut rx).await {
        SocketEvent::AcceptFailed(outcome) => {
            assert_eq!(outcome.kind, ProxyErrorKind::ProxyConnectFailed);
        }
        other => panic!("expected AcceptFailed, got {:?}", other),
    }
    reactor.stop();
}

// ─── Timers, messages, swap ──────────────────────────────────────────

#[tokio::test]
async fn past_deadline_timer_fires_on_next_tick() {
    let reactor = Reactor::start(EngineConfig::default());
    let (conn, mut rx) = registered(&reactor);
    assert!(conn.schedule_timer(42, Duration::ZERO, 7));
    match next_event(&mut rx).await {
        SocketEvent::Timer { id, param } => {
            assert_eq!(id, 42);
            assert_eq!(param, 7);
        }
        other => panic!("expected Timer, got {:?}", other),
    }
    reactor.stop();
}

#[tokio::test]
async fn equal_deadline_timers_fire_in_scheduling_order() {
    let reactor = Reactor::start(EngineConfig::default());
    let (conn, mut rx) = registered(&reactor);
    for id in 0..5u32 {
        assert!(conn.schedule_timer(id, Duration::from_millis(20), 0));
    }
    for expect in 0..5u32 {
        match next_event(&mut rx).await {
            SocketEvent::Timer { id, .. } => assert_eq!(id, expect),
            other => panic!("expected Timer, got {:?}", other),
        }
    }
    reactor.stop();
}

#[tokio::test]
async fn posted_messages_arrive_in_order_and_stale_uids_drop() {
    let reactor = Reactor::start(EngineConfig::default());
    let (conn, mut rx) = registered(&reactor);
    for id in 1..=3u32 {
        assert!(conn.post_message(id, u64::from(id) * 10));
    }
    for expect in 1..=3u32 {
        match next_event(&mut rx).await {
            SocketEvent::Message { id, param } => {
                assert_eq!(id, expect);
                assert_eq!(param, u64::from(expect) * 10);
            }
            other => panic!("expected Message, got {:?}", other),
        }
    }
    let stale = conn.uid();
    drop(conn);
    assert!(!reactor.post_message(stale, 9, 0));
    reactor.stop();
}

#[tokio::test]
async fn swap_exchanges_transports_and_handles() {
    let reactor = Reactor::start(EngineConfig::default());
    let (a, mut rx_a) = registered(&reactor);
    let (b, mut rx_b) = registered(&reactor);

    let listener = TcpListener::bind((LOCAL, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    a.connect(LOCAL, port).unwrap();
    let (mut peer_a, _) = listener.accept().await.unwrap();
    assert!(matches!(next_event(&mut rx_a).await, SocketEvent::Connected));
    assert!(matches!(next_event(&mut rx_a).await, SocketEvent::Writable));

    b.connect(LOCAL, port).unwrap();
    let (mut peer_b, _) = listener.accept().await.unwrap();
    assert!(matches!(next_event(&mut rx_b).await, SocketEvent::Connected));
    assert!(matches!(next_event(&mut rx_b).await, SocketEvent::Writable));

    let handle_a = a.handle().unwrap();
    let handle_b = b.handle().unwrap();
    assert!(reactor.swap(a.uid(), b.uid()));
    assert_eq!(a.handle(), Some(handle_b));
    assert_eq!(b.handle(), Some(handle_a));

    // a's old peer now talks to b, and vice versa.
    peer_a.write_all(b"one").await.unwrap();
    assert!(matches!(next_event(&mut rx_b).await, SocketEvent::Readable));
    assert_eq!(&b.recv(8).unwrap(), b"one");

    peer_b.write_all(b"two").await.unwrap();
    assert!(matches!(next_event(&mut rx_a).await, SocketEvent::Readable));
    assert_eq!(&a.recv(8).unwrap(), b"two");
    reactor.stop();
}

#[tokio::test]
async fn resolve_host_async_reports_back() {
    let reactor = Reactor::start(EngineConfig::default());
    let (conn, mut rx) = registered(&reactor);
    assert!(conn.resolve_host_async(5, "127.0.0.1"));
    match next_event(&mut rx).await {
        SocketEvent::HostResolved { request_id, ip, .. } => {
            assert_eq!(request_id, 5);
            assert_eq!(ip, Some(LOCAL));
        }
        other => panic!("expected HostResolved, got {:?}", other),
    }
    reactor.stop();
}

#[tokio::test]
async fn peer_close_emits_closed_event() {
    let reactor = Reactor::start(EngineConfig::default());
    let (conn, mut rx) = registered(&reactor);

    let listener = TcpListener::bind((LOCAL, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    conn.connect(LOCAL, port).unwrap();
    let (peer, _) = listener.accept().await.unwrap();
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Connected));
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Writable));
    assert!(conn.is_connected());

    drop(peer);
    // EOF surfaces as Readable; recv sees it and the driver closes.
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Readable));
    assert!(conn.recv(16).unwrap().is_empty());
    assert!(matches!(next_event(&mut rx).await, SocketEvent::Closed { .. }));
    assert_eq!(conn.state(), SocketState::Closed);
    reactor.stop();
}
