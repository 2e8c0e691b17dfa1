//! Inbound frame dispatcher
//!
//! The only reader of the control socket. Routes each frame to the
//! connection registry and hands new connections to their own dial task.
//! The session ends on `kick`, end-of-stream, a malformed frame, or
//! cancellation of the session token, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use qp_protocol::{ConnId, Frame, ProtocolError};

use super::writer::FrameSender;
use crate::error::SessionError;
use crate::local::{spawn_connect, ConnectionRegistry, LocalConnection};
use crate::proxy::ProxyConfig;
use crate::status::StatusPublisher;

/// Routes frames from the relay for one authenticated session
pub struct Dispatcher {
    /// Proxies granted at login
    proxies: Arc<[ProxyConfig]>,
    /// Open local connections
    registry: Arc<ConnectionRegistry>,
    /// Queue to the control socket writer
    outbound: FrameSender,
    /// Status shared with observers
    status: StatusPublisher,
    /// Session cancellation; forwarders get child tokens
    cancel: CancellationToken,
    /// Bound on dialing the local service
    local_connect_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher for one session
    pub fn new(
        proxies: Arc<[ProxyConfig]>,
        registry: Arc<ConnectionRegistry>,
        outbound: FrameSender,
        status: StatusPublisher,
        cancel: CancellationToken,
        local_connect_timeout: Duration,
    ) -> Self {
        Self {
            proxies,
            registry,
            outbound,
            status,
            cancel,
            local_connect_timeout,
        }
    }

    /// Read frames until the session ends.
    ///
    /// Returns the reason the session ended.
    pub async fn run<S>(&self, mut frames: S) -> SessionError
    where
        S: Stream<Item = Result<Frame, ProtocolError>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return SessionError::Shutdown,
                next = frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return SessionError::Protocol(e),
                None => return SessionError::ServerClosed,
            };

            // A local write can stall indefinitely; cancellation must still win
            let handled = tokio::select! {
                _ = self.cancel.cancelled() => return SessionError::Shutdown,
                handled = self.handle_frame(frame) => handled,
            };
            if let Err(reason) = handled {
                return reason;
            }
        }
    }

    /// Handle a single frame. An error ends the session.
    pub async fn handle_frame(&self, frame: Frame) -> Result<(), SessionError> {
        match frame {
            Frame::NewConn {
                proxy_name,
                conn_id,
            } => self.handle_new_conn(&proxy_name, conn_id),

            Frame::Data { conn_id, data } => self.handle_data(conn_id, data).await,

            Frame::Close { conn_id } => self.handle_close(&conn_id).await,

            Frame::Kick => {
                tracing::warn!("Received kick message from server. Disconnecting...");
                self.status.kicked();
                return Err(SessionError::Kicked);
            }

            Frame::Login { .. } | Frame::LoginSuccess { .. } | Frame::LoginFailed { .. } => {
                tracing::warn!("Unexpected {} frame after login", frame.kind());
            }

            Frame::Unknown => {
                tracing::debug!("Ignoring frame of unknown type");
            }
        }

        Ok(())
    }

    fn find_proxy(&self, name: &str) -> Option<&ProxyConfig> {
        self.proxies.iter().find(|proxy| proxy.name == name)
    }

    fn handle_new_conn(&self, proxy_name: &str, conn_id: ConnId) {
        let Some(proxy) = self.find_proxy(proxy_name) else {
            tracing::warn!("Unknown proxy: {}", proxy_name);
            return;
        };

        // Registered before dialing so `data` that follows is buffered, not lost
        let conn = LocalConnection::pending(self.cancel.child_token());
        if let Err(e) = self.registry.put(conn_id.clone(), conn.clone()) {
            tracing::error!("{}; ignoring new_conn", e);
            return;
        }

        let local_addr = proxy.local_addr();
        tracing::debug!("Dialing {} for connection {} ({})", local_addr, conn_id, proxy_name);

        spawn_connect(
            conn_id,
            local_addr,
            self.local_connect_timeout,
            conn,
            Arc::clone(&self.registry),
            self.outbound.clone(),
        );
    }

    async fn handle_data(&self, conn_id: ConnId, data: Bytes) {
        let Some(conn) = self.registry.get(&conn_id) else {
            tracing::trace!("Dropping {} bytes for closed connection {}", data.len(), conn_id);
            return;
        };

        if let Err(e) = conn.write_all(data).await {
            // The forwarder's teardown removes the entry and notifies the relay
            tracing::debug!("Write to local connection {} failed: {}", conn_id, e);
            conn.cancel_token().cancel();
        }
    }

    async fn handle_close(&self, conn_id: &ConnId) {
        if let Some(conn) = self.registry.remove(conn_id) {
            conn.close().await;
            tracing::info!("Connection {} closed", conn_id);
        } else {
            tracing::debug!("Close for unknown connection {}", conn_id);
        }
    }
}
