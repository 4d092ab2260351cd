//! Integration tests for unix domain socket forwarding

#![cfg(unix)]

mod common;

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::time::timeout;

use iriguchikun::config::{Address, Protocol};
use iriguchikun::{ListenerManager, ProxyRule, ShutdownCoordinator};

use common::spawn_tcp_echo;

#[tokio::test]
async fn test_unix_listener_to_tcp_target() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("proxy.sock");
    let echo = spawn_tcp_echo().await;

    let manager = ListenerManager::new(ShutdownCoordinator::new(Duration::from_secs(2)));
    let rule = ProxyRule::new(Protocol::Unix, socket_path.to_str().unwrap(), "unused")
        .unwrap()
        .with_target(Protocol::Tcp, Address::Socket(echo));
    let handle = manager.start(rule).await.unwrap();
    assert_eq!(handle.local_addr().path(), Some(socket_path.as_path()));

    let mut client = UnixStream::connect(&socket_path).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    drop(client);

    assert!(manager.shutdown(vec![handle]).await);
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_tcp_listener_to_unix_target() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("target.sock");

    let target = UnixListener::bind(&target_path).unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = target.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    let manager = ListenerManager::new(ShutdownCoordinator::new(Duration::from_secs(2)));
    let rule = ProxyRule::new(Protocol::Tcp, "127.0.0.1:0", "127.0.0.1:1")
        .unwrap()
        .with_target(Protocol::Unix, Address::Unix(target_path.clone()));
    let handle = manager.start(rule).await.unwrap();
    let proxy = handle.local_addr().socket_addr().unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"over a unix socket").await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"over a unix socket");
}

#[tokio::test]
async fn test_existing_socket_file_fails_bind() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("taken.sock");
    let _occupant = UnixListener::bind(&socket_path).unwrap();

    let manager = ListenerManager::new(ShutdownCoordinator::new(Duration::from_secs(2)));
    let rule = ProxyRule::new(Protocol::Unix, socket_path.to_str().unwrap(), "/tmp/target.sock")
        .unwrap();

    let err = manager.start(rule).await.unwrap_err();
    assert!(matches!(err, iriguchikun::ProxyError::Bind { .. }));
}
