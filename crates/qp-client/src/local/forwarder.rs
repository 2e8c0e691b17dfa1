//! Local service side of a logical connection
//!
//! A forwarder owns the read half of one local socket and turns everything
//! it reads into `data` frames. When reading stops for any reason it tears
//! the connection down and reports it to the relay with a `close` frame.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use qp_protocol::ConnId;

use super::registry::{ConnectionRegistry, LocalConnection};
use crate::error::ForwardError;
use crate::tunnel::FrameSender;

/// Size of each read from the local socket
pub const READ_CHUNK_SIZE: usize = 4096;

/// Connect to the local service for a new logical connection
pub async fn dial_local(addr: &str, timeout: Duration) -> Result<TcpStream, ForwardError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::trace!("Failed to set TCP_NODELAY on {}: {}", addr, e);
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(ForwardError::LocalDial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ForwardError::DialTimeout(addr.to_string())),
    }
}

/// Dial the local service for a registered pending connection, then
/// forward it.
///
/// Runs off the dispatch loop so a slow local service never delays frames
/// for other connections. Dial failure, timeout, or a `close` that arrives
/// first all end in the same teardown as a finished forwarder.
pub fn spawn_connect(
    conn_id: ConnId,
    addr: String,
    timeout: Duration,
    conn: LocalConnection,
    registry: Arc<ConnectionRegistry>,
    outbound: FrameSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = conn.cancel_token().clone();
        let dialed = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Connection {} closed before {} answered", conn_id, addr);
                teardown(&conn_id, &conn, &registry, &outbound).await;
                return;
            }
            dialed = dial_local(&addr, timeout) => dialed,
        };

        let stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("{} (connection {})", e, conn_id);
                teardown(&conn_id, &conn, &registry, &outbound).await;
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        if let Err(e) = conn.attach(writer).await {
            tracing::debug!("Local connection {} not attached: {}", conn_id, e);
            teardown(&conn_id, &conn, &registry, &outbound).await;
            return;
        }

        tracing::info!("New proxy connection {} -> {}", conn_id, addr);
        forward(conn_id, reader, conn, registry, outbound).await;
    })
}

/// Spawn the forwarder for a registered, connected local socket
pub fn spawn_forwarder<R>(
    conn_id: ConnId,
    reader: R,
    conn: LocalConnection,
    registry: Arc<ConnectionRegistry>,
    outbound: FrameSender,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(forward(conn_id, reader, conn, registry, outbound))
}

async fn forward<R>(
    conn_id: ConnId,
    reader: R,
    conn: LocalConnection,
    registry: Arc<ConnectionRegistry>,
    outbound: FrameSender,
) where
    R: AsyncRead + Unpin,
{
    pump_local(&conn_id, reader, &conn, &outbound).await;

    // Teardown runs on every exit path, cancellation included
    teardown(&conn_id, &conn, &registry, &outbound).await;
    tracing::debug!("Forwarder for {} exited", conn_id);
}

async fn teardown(
    conn_id: &ConnId,
    conn: &LocalConnection,
    registry: &ConnectionRegistry,
    outbound: &FrameSender,
) {
    conn.close().await;
    if registry.remove_entry(conn_id, conn).is_some() {
        tracing::debug!("Connection {} removed by its forwarder", conn_id);
    }
    if !outbound.send_close(conn_id.clone()).await {
        tracing::trace!("Control channel gone, close for {} not sent", conn_id);
    }
}

async fn pump_local<R>(
    conn_id: &ConnId,
    mut reader: R,
    conn: &LocalConnection,
    outbound: &FrameSender,
) where
    R: AsyncRead + Unpin,
{
    let cancel = conn.cancel_token();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Forwarder for {} cancelled", conn_id);
                return;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("Local EOF for {}", conn_id);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Local connection read error for {}: {}", conn_id, e);
                    return;
                }
            },
        };

        let data = Bytes::copy_from_slice(&buf[..n]);
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = outbound.send_data(conn_id.clone(), data) => sent,
        };
        if !sent {
            tracing::debug!("Control channel closed, stopping forwarder for {}", conn_id);
            return;
        }
    }
}
