//! Forwarding integration tests
//!
//! Drives logical connections from a scripted relay through the client to
//! real local TCP services.

mod common;

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use qp_protocol::{ConnId, Frame};

use common::{
    client_config, closed_port, echo_service, token_info, wait_for_status, FakeRelay, RelayConn,
    RunningClient, STEP_TIMEOUT,
};

/// Start a client and complete login against `local_port`
async fn logged_in(relay: &FakeRelay, local_port: u16) -> (RunningClient, RelayConn) {
    let client = RunningClient::start(client_config(relay.address(), Duration::from_secs(30)));
    let mut status = client.session.status();
    let mut conn = relay.accept().await;
    conn.accept_login(token_info(local_port)).await;
    wait_for_status(&mut status, |s| s.active).await;
    (client, conn)
}

/// Local service that reads one connection to EOF and reports the bytes
async fn recording_service() -> (u16, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received).await;
        let _ = tx.send(received);
    });
    (port, rx)
}

#[tokio::test]
async fn test_echo_round_trip_is_byte_exact() {
    let relay = FakeRelay::bind().await;
    let (client, mut conn) = logged_in(&relay, echo_service().await).await;

    conn.new_conn("c1").await;
    client.wait_for_connections(1).await;

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(7_000) {
        conn.data("c1", chunk).await;
    }

    let echoed = conn.recv_data("c1", payload.len()).await;
    assert_eq!(echoed, payload);

    client.stop().await;
}

#[tokio::test]
async fn test_local_eof_sends_close() {
    let relay = FakeRelay::bind().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"SSH-2.0-banner\r\n").await.unwrap();
        stream.shutdown().await.unwrap();
        // Hold the socket so only the write side is closed
        tokio::time::sleep(STEP_TIMEOUT).await;
    });

    let (client, mut conn) = logged_in(&relay, local_port).await;
    conn.new_conn("c1").await;

    let banner = conn.recv_data("c1", 16).await;
    assert_eq!(banner, b"SSH-2.0-banner\r\n");
    assert_eq!(conn.recv().await, Frame::close(ConnId::new("c1")));

    client.wait_for_connections(0).await;
    client.stop().await;
}

#[tokio::test]
async fn test_close_only_affects_its_connection() {
    let relay = FakeRelay::bind().await;
    let (client, mut conn) = logged_in(&relay, echo_service().await).await;

    conn.new_conn("c1").await;
    conn.new_conn("c2").await;
    client.wait_for_connections(2).await;

    conn.close("c1").await;
    assert_eq!(conn.recv().await, Frame::close(ConnId::new("c1")));
    client.wait_for_connections(1).await;
    assert!(client.session.registry().contains(&ConnId::new("c2")));
    assert!(!client.session.registry().contains(&ConnId::new("c1")));

    conn.data("c2", b"still here").await;
    assert_eq!(conn.recv_data("c2", 10).await, b"still here");

    client.stop().await;
}

#[tokio::test]
async fn test_data_after_close_is_dropped() {
    let relay = FakeRelay::bind().await;
    let (local_port, received) = recording_service().await;
    let (client, mut conn) = logged_in(&relay, local_port).await;

    conn.new_conn("c1").await;
    client.wait_for_open("c1").await;
    conn.data("c1", b"before").await;
    conn.close("c1").await;
    conn.data("c1", b"after").await;

    let received = tokio::time::timeout(STEP_TIMEOUT, received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"before");
    client.wait_for_connections(0).await;

    client.stop().await;
}

#[tokio::test]
async fn test_repeated_close_is_harmless() {
    let relay = FakeRelay::bind().await;
    let (client, mut conn) = logged_in(&relay, echo_service().await).await;

    conn.new_conn("c1").await;
    client.wait_for_connections(1).await;

    conn.close("c1").await;
    assert_eq!(conn.recv().await, Frame::close(ConnId::new("c1")));
    conn.close("c1").await;
    conn.close("c1").await;
    conn.expect_silence(Duration::from_millis(200)).await;

    // Session still serves new connections
    conn.new_conn("c2").await;
    conn.data("c2", b"ping").await;
    assert_eq!(conn.recv_data("c2", 4).await, b"ping");

    client.stop().await;
}

#[tokio::test]
async fn test_unreachable_local_service_sends_close() {
    let relay = FakeRelay::bind().await;
    let (client, mut conn) = logged_in(&relay, closed_port().await).await;

    conn.new_conn("c1").await;
    assert_eq!(conn.recv().await, Frame::close(ConnId::new("c1")));
    conn.expect_silence(Duration::from_millis(200)).await;
    assert!(client.session.registry().is_empty());

    client.stop().await;
}

#[tokio::test]
async fn test_session_end_closes_local_connections() {
    let relay = FakeRelay::bind().await;
    let (local_port, received) = recording_service().await;
    let (client, mut conn) = logged_in(&relay, local_port).await;

    conn.new_conn("c1").await;
    client.wait_for_open("c1").await;
    conn.data("c1", b"partial").await;

    conn.send(Frame::Kick).await;

    // Local socket is closed when the session ends
    let received = tokio::time::timeout(STEP_TIMEOUT, received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"partial");
    client.wait_for_connections(0).await;

    client.stop().await;
}

#[tokio::test]
async fn test_data_sent_during_dial_arrives_in_order() {
    let relay = FakeRelay::bind().await;
    let (client, mut conn) = logged_in(&relay, echo_service().await).await;

    // No waiting between new_conn and data: early bytes must not be lost
    conn.new_conn("c1").await;
    conn.data("c1", b"first ").await;
    conn.data("c1", b"second").await;

    assert_eq!(conn.recv_data("c1", 12).await, b"first second");

    client.stop().await;
}

#[tokio::test]
async fn test_shutdown_with_stalled_local_write() {
    let relay = FakeRelay::bind().await;

    // Accepts and holds connections without ever reading
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let (client, mut conn) = logged_in(&relay, local_port).await;
    conn.new_conn("c1").await;
    client.wait_for_open("c1").await;

    // Far more than the socket buffers hold; the relay side may block too
    tokio::spawn(async move {
        let chunk = Bytes::from(vec![0x5au8; 64 * 1024]);
        for _ in 0..512 {
            let frame = Frame::data(ConnId::new("c1"), chunk.clone());
            if !conn.try_send(frame).await {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    client.stop().await;
}
