//! Integration tests for UDP forwarding

mod common;

use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::sleep;

use iriguchikun::config::{Protocol, SessionSettings};

use common::{recv_datagram, spawn_udp_echo, start_proxy, wait_for_counter};

#[tokio::test]
async fn test_udp_ping_echo() {
    let echo = spawn_udp_echo().await;
    let (_manager, handle, proxy) =
        start_proxy(Protocol::Udp, echo, SessionSettings::default()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", proxy).await.unwrap();
    assert_eq!(recv_datagram(&client).await, b"ping");

    // Same source, same session.
    client.send_to(b"pong", proxy).await.unwrap();
    assert_eq!(recv_datagram(&client).await, b"pong");

    let snapshot = handle.stats().snapshot("udp");
    assert_eq!(snapshot.sessions_accepted, 1);
    assert_eq!(snapshot.sessions_active, 1);
}

#[tokio::test]
async fn test_udp_sessions_are_per_source() {
    let echo = spawn_udp_echo().await;
    let (_manager, handle, proxy) =
        start_proxy(Protocol::Udp, echo, SessionSettings::default()).await;

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    first.send_to(b"from first", proxy).await.unwrap();
    second.send_to(b"from second", proxy).await.unwrap();

    assert_eq!(recv_datagram(&first).await, b"from first");
    assert_eq!(recv_datagram(&second).await, b"from second");

    let stats = handle.stats();
    assert_eq!(stats.snapshot("udp").sessions_accepted, 2);
    assert_eq!(stats.active(), 2);
}

#[tokio::test]
async fn test_udp_idle_session_is_evicted_and_recreated() {
    let echo = spawn_udp_echo().await;
    let settings = SessionSettings {
        idle_timeout: Duration::from_millis(200),
        ..SessionSettings::default()
    };
    let (_manager, handle, proxy) = start_proxy(Protocol::Udp, echo, settings).await;
    let stats = handle.stats();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", proxy).await.unwrap();
    assert_eq!(recv_datagram(&client).await, b"ping");

    sleep(Duration::from_millis(300)).await;
    assert!(wait_for_counter(&stats, 1, |s| &s.idle_timeouts).await);
    assert!(wait_for_counter(&stats, 0, |s| &s.sessions_active).await);

    client.send_to(b"again", proxy).await.unwrap();
    assert_eq!(recv_datagram(&client).await, b"again");

    let snapshot = stats.snapshot("udp");
    assert_eq!(snapshot.sessions_accepted, 2);
    assert_eq!(snapshot.sessions_active, 1);
}

#[tokio::test]
async fn test_udp_shutdown_closes_sessions() {
    let echo = spawn_udp_echo().await;
    let (manager, handle, proxy) =
        start_proxy(Protocol::Udp, echo, SessionSettings::default()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", proxy).await.unwrap();
    assert_eq!(recv_datagram(&client).await, b"ping");

    let stats = handle.stats();
    assert!(manager.shutdown(vec![handle]).await);
    assert_eq!(stats.active(), 0);
    assert_eq!(stats.snapshot("udp").bytes_up, 4);
}
