//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::TlsAcceptor;

use iriguchikun::config::{Protocol, SessionSettings};
use iriguchikun::metrics::ListenerStats;
use iriguchikun::{ListenerHandle, ListenerManager, ProxyRule, ShutdownCoordinator};

/// TCP server that echoes every byte back and half-closes on EOF
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// TLS server with a fresh self-signed certificate that echoes every byte
/// back and closes its side on EOF
pub async fn spawn_tls_echo() -> SocketAddr {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certs = vec![CertificateDer::from(certified.cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(stream).await else {
                    return;
                };
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// UDP server that sends every datagram back to its source
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((n, source)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], source).await;
        }
    });

    addr
}

/// Address that refuses connections
pub async fn closed_tcp_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Start a single rule on an ephemeral loopback port
pub async fn start_proxy(
    protocol: Protocol,
    target: SocketAddr,
    settings: SessionSettings,
) -> (ListenerManager, ListenerHandle, SocketAddr) {
    let manager = ListenerManager::new(ShutdownCoordinator::new(Duration::from_secs(2)));
    let rule = ProxyRule::new(protocol, "127.0.0.1:0", &target.to_string())
        .unwrap()
        .with_settings(settings);
    let handle = manager.start(rule).await.unwrap();
    let addr = handle.local_addr().socket_addr().unwrap();
    (manager, handle, addr)
}

/// Poll a counter until it reaches `expected` or a second passes
pub async fn wait_for_counter<F>(stats: &ListenerStats, expected: u64, counter: F) -> bool
where
    F: Fn(&ListenerStats) -> &std::sync::atomic::AtomicU64,
{
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(1) {
        if counter(stats).load(Ordering::Relaxed) == expected {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    counter(stats).load(Ordering::Relaxed) == expected
}

/// Receive one datagram with a timeout
pub async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 65_535];
    let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf.truncate(n);
    buf
}
