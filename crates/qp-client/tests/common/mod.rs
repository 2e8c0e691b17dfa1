//! Shared helpers: a scripted relay server and local services

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use qp_client::{ControlSession, SessionStatus};
use qp_core::ClientConfig;
use qp_protocol::{ConnId, Frame, FrameCodec, TokenInfo};

/// Upper bound for any single wait in a test
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A relay server the test drives frame by frame
pub struct FakeRelay {
    listener: TcpListener,
}

impl FakeRelay {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn address(&self) -> String {
        self.listener.local_addr().unwrap().to_string()
    }

    /// Accept the next control connection
    pub async fn accept(&self) -> RelayConn {
        let (stream, _) = timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("client did not connect in time")
            .unwrap();
        let (read, write) = stream.into_split();
        RelayConn {
            frames: FramedRead::new(read, FrameCodec::new()),
            sink: FramedWrite::new(write, FrameCodec::new()),
        }
    }

    /// Check that no control connection arrives within `window`
    pub async fn expect_no_connect(&self, window: Duration) {
        assert!(
            timeout(window, self.listener.accept()).await.is_err(),
            "unexpected connect attempt"
        );
    }
}

/// Relay side of one control connection
pub struct RelayConn {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl RelayConn {
    pub async fn send(&mut self, frame: Frame) {
        self.sink.send(frame).await.unwrap();
    }

    /// Send without panicking; false once the client has gone away
    pub async fn try_send(&mut self, frame: Frame) -> bool {
        self.sink.send(frame).await.is_ok()
    }

    pub async fn recv(&mut self) -> Frame {
        timeout(STEP_TIMEOUT, self.frames.next())
            .await
            .expect("no frame from client in time")
            .expect("client closed control connection")
            .unwrap()
    }

    /// Check that the client sends nothing within `window`
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(frame)) = timeout(window, self.frames.next()).await {
            panic!("unexpected frame {:?}", frame);
        }
    }

    /// Read the login, answer with `login_success` for `info`
    pub async fn accept_login(&mut self, info: TokenInfo) -> String {
        let token = match self.recv().await {
            Frame::Login { token, data } => {
                assert_eq!(&data[..], b"{}");
                token
            }
            other => panic!("expected login, got {:?}", other),
        };
        self.send(Frame::LoginSuccess {
            token_info: Some(info),
            data: Bytes::from_static(b"welcome"),
        })
        .await;
        token
    }

    pub async fn new_conn(&mut self, conn_id: &str) {
        self.send(Frame::NewConn {
            proxy_name: "tcp".to_string(),
            conn_id: ConnId::new(conn_id),
        })
        .await;
    }

    pub async fn data(&mut self, conn_id: &str, data: &[u8]) {
        self.send(Frame::data(ConnId::new(conn_id), Bytes::copy_from_slice(data)))
            .await;
    }

    pub async fn close(&mut self, conn_id: &str) {
        self.send(Frame::close(ConnId::new(conn_id))).await;
    }

    /// Collect `len` bytes of data frames for `conn_id`
    pub async fn recv_data(&mut self, conn_id: &str, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < len {
            match self.recv().await {
                Frame::Data { conn_id: id, data } if id.as_str() == conn_id => {
                    received.extend_from_slice(&data)
                }
                other => panic!("expected data for {}, got {:?}", conn_id, other),
            }
        }
        received
    }
}

/// Local TCP service echoing every byte back until EOF; returns its port
pub async fn echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    port
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait until the published status satisfies `predicate`
pub async fn wait_for_status<F>(rx: &mut watch::Receiver<SessionStatus>, predicate: F)
where
    F: Fn(&SessionStatus) -> bool,
{
    timeout(STEP_TIMEOUT, async {
        while !predicate(&rx.borrow_and_update()) {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status never matched, last {:?}", *rx.borrow()));
}

/// Token metadata pointing at a local service on `local_port`
pub fn token_info(local_port: u16) -> TokenInfo {
    TokenInfo {
        email: "user@example.com".to_string(),
        protocol_type: "tcp".to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port,
        remote_port: 30001,
        bandwidth_limit: "unlimited".to_string(),
        ..TokenInfo::default()
    }
}

pub fn client_config(server_address: String, reconnect_delay: Duration) -> ClientConfig {
    ClientConfig {
        server_address,
        token: "test-token".to_string(),
        public_host: "relay.test".to_string(),
        reconnect_delay,
        local_connect_timeout: Duration::from_secs(2),
    }
}

/// A running client session plus the token that stops it
pub struct RunningClient {
    pub session: Arc<ControlSession>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl RunningClient {
    pub fn start(config: ClientConfig) -> Self {
        let session = Arc::new(ControlSession::new(config));
        let shutdown = CancellationToken::new();
        let handle = {
            let session = Arc::clone(&session);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { session.start(shutdown).await })
        };
        Self {
            session,
            shutdown,
            handle,
        }
    }

    /// Wait until the registry holds exactly `count` connections
    pub async fn wait_for_connections(&self, count: usize) {
        let registry = Arc::clone(self.session.registry());
        timeout(STEP_TIMEOUT, async {
            while registry.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "registry has {} connections, expected {}",
                registry.len(),
                count
            )
        });
    }

    /// Wait until `conn_id` is connected to the local service
    pub async fn wait_for_open(&self, conn_id: &str) {
        let registry = Arc::clone(self.session.registry());
        let id = ConnId::new(conn_id);
        timeout(STEP_TIMEOUT, async {
            while !registry.get(&id).is_some_and(|conn| conn.is_open()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("connection {} never opened", conn_id));
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        timeout(STEP_TIMEOUT, self.handle)
            .await
            .expect("session did not stop")
            .unwrap();
    }
}
