//! Single writer for the control socket
//!
//! The dispatcher and every forwarder produce frames concurrently. They all
//! push into one bounded queue, and one task drains it into the socket, so
//! frames can never interleave on the wire.

use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use qp_protocol::{ConnId, Frame, ProtocolError};

/// Capacity of the outbound frame queue.
///
/// Forwarders wait when it is full, which bounds memory when the control
/// socket is slower than the local services.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Cloneable handle for queueing frames to the relay
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    /// Create a sender and the receiver the writer task drains
    pub fn channel() -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queue a frame. Returns false once the writer has stopped.
    pub async fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Queue a `data` frame
    pub async fn send_data(&self, conn_id: ConnId, data: Bytes) -> bool {
        self.send(Frame::data(conn_id, data)).await
    }

    /// Queue a `close` frame
    pub async fn send_close(&self, conn_id: ConnId) -> bool {
        self.send(Frame::close(conn_id)).await
    }
}

/// Drain queued frames into `sink` until cancelled, the queue closes, or a
/// write fails.
pub async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError>
where
    S: Sink<Frame, Error = ProtocolError> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        tracing::trace!("Sending {} frame", frame.kind());
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sink.send(frame) => sent?,
        }
    }

    Ok(())
}

/// Spawn the writer task. A write failure cancels the whole session.
pub fn spawn_writer<S>(
    sink: S,
    rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), ProtocolError>>
where
    S: Sink<Frame, Error = ProtocolError> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = run_writer(sink, rx, cancel.clone()).await;
        if let Err(e) = &result {
            tracing::warn!("Control channel write failed: {}", e);
        }
        cancel.cancel();
        result
    })
}
