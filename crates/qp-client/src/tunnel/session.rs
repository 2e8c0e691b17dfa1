//! Control session manager
//!
//! Drives the control connection through its lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Active -> Disconnected -> Connecting ...
//! ```
//!
//! Every way a session can end (unreachable relay, rejected token, malformed
//! frame, closed socket, `kick`) is followed by the same fixed reconnect
//! delay. Only process shutdown stops the loop.

use std::sync::{Arc, PoisonError, RwLock};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use qp_core::ClientConfig;
use qp_protocol::{Frame, FrameCodec, ProtocolError};

use super::dispatcher::Dispatcher;
use super::writer::{spawn_writer, FrameSender};
use crate::error::SessionError;
use crate::local::ConnectionRegistry;
use crate::proxy::ProxyConfig;
use crate::status::{SessionStatus, StatusPublisher};

/// Client side of one relay control connection, reconnecting forever
pub struct ControlSession {
    /// Client configuration
    config: ClientConfig,
    /// Proxies from the most recent login
    proxies: RwLock<Arc<[ProxyConfig]>>,
    /// Open local connections
    registry: Arc<ConnectionRegistry>,
    /// Status published to observers
    status: StatusPublisher,
}

impl ControlSession {
    /// Create a session manager; nothing connects until [`start`](Self::start)
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            proxies: RwLock::new(Arc::from(Vec::new())),
            registry: Arc::new(ConnectionRegistry::new()),
            status: StatusPublisher::new(),
        }
    }

    /// Get the client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to status updates
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Get the connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Proxies granted by the most recent successful login
    pub fn proxies(&self) -> Arc<[ProxyConfig]> {
        Arc::clone(&self.proxies.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Local service port, or 0 before the first login
    pub fn local_port(&self) -> u16 {
        self.proxies().first().map(|p| p.local_port).unwrap_or(0)
    }

    /// Public port on the relay, or 0 before the first login
    pub fn public_port(&self) -> u16 {
        self.proxies().first().map(|p| p.remote_port).unwrap_or(0)
    }

    /// Run the connect/serve/retry loop until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) {
        let delay = self.config.reconnect_delay;
        self.status.set_running(true);

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    let reason = self.serve(stream, &shutdown).await;
                    self.status.revoke();
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tracing::warn!("Connection error: {}", reason);
                    tracing::info!("Disconnected from server. Retrying in {:?}...", delay);
                }
                Err(e) => {
                    tracing::warn!("Connection failed: {}", e);
                    tracing::info!("Retrying in {:?}...", delay);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.revoke();
        self.status.set_running(false);
        tracing::info!("Session manager stopped");
    }

    /// Open the control socket
    pub async fn connect(&self) -> Result<TcpStream, SessionError> {
        let addr = &self.config.server_address;
        tracing::debug!("Connecting to {}", addr);

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SessionError::Connect {
                addr: addr.clone(),
                source,
            })?;

        tracing::info!("Connected to relay server at {}", addr);
        Ok(stream)
    }

    /// Authenticate, then dispatch until the session ends.
    ///
    /// Returns the reason the session ended. All local connections are
    /// closed before returning.
    pub async fn serve(&self, stream: TcpStream, shutdown: &CancellationToken) -> SessionError {
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let mut sink = FramedWrite::new(write_half, FrameCodec::new());

        let proxies = tokio::select! {
            _ = shutdown.cancelled() => return SessionError::Shutdown,
            result = self.login(&mut frames, &mut sink) => match result {
                Ok(proxies) => proxies,
                Err(e) => return e,
            },
        };

        let cancel = shutdown.child_token();
        let (outbound, outbound_rx) = FrameSender::channel();
        let writer = spawn_writer(sink, outbound_rx, cancel.clone());

        let dispatcher = Dispatcher::new(
            proxies,
            Arc::clone(&self.registry),
            outbound,
            self.status.clone(),
            cancel.clone(),
            self.config.local_connect_timeout,
        );
        let reason = dispatcher.run(frames).await;

        // Unblocks every forwarder and the writer
        cancel.cancel();
        drop(dispatcher);
        if let Err(e) = writer.await {
            tracing::error!("Writer task failed: {}", e);
        }
        self.close_all().await;

        reason
    }

    /// Send `login` and wait for the single reply.
    ///
    /// On success the proxy list is rebuilt from the token metadata and the
    /// session is published as active.
    pub async fn login<S, K>(
        &self,
        frames: &mut S,
        sink: &mut K,
    ) -> Result<Arc<[ProxyConfig]>, SessionError>
    where
        S: Stream<Item = Result<Frame, ProtocolError>> + Unpin,
        K: Sink<Frame, Error = ProtocolError> + Unpin,
    {
        tracing::debug!("Logging in with token {}", self.config.masked_token());
        sink.send(Frame::login(self.config.token.clone())).await?;

        let reply = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(SessionError::LoginFailed(e.to_string())),
            None => {
                return Err(SessionError::LoginFailed(
                    "server closed connection before replying".to_string(),
                ))
            }
        };

        match reply {
            Frame::LoginSuccess {
                token_info: Some(info),
                data,
            } => {
                tracing::info!("Login successful with token info:");
                tracing::info!("  Email: {}", info.email);
                tracing::info!("  Protocol: {}", info.protocol_type);
                tracing::info!("  Local: {}:{}", info.local_ip, info.local_port);
                tracing::info!("  Remote Port: {}", info.remote_port);
                tracing::info!("  Bandwidth: {}", info.bandwidth_limit);
                if !data.is_empty() {
                    tracing::info!("Server message: {}", String::from_utf8_lossy(&data));
                }

                let proxy = ProxyConfig::from_token_info(&info);
                tracing::info!(
                    "  - {}: {} -> :{}",
                    proxy.name,
                    proxy.local_addr(),
                    proxy.remote_port
                );

                let public_host = &self.config.public_host;
                let public_addr = format!("{}:{}", public_host, proxy.remote_port);
                let route = format!(
                    "localhost:{} <-----> {}:{}",
                    proxy.local_port, public_host, proxy.remote_port
                );

                let proxies: Arc<[ProxyConfig]> = Arc::from(vec![proxy]);
                *self.proxies.write().unwrap_or_else(PoisonError::into_inner) =
                    Arc::clone(&proxies);
                self.status.activate(public_addr, route);

                Ok(proxies)
            }
            Frame::LoginSuccess {
                token_info: None, ..
            } => Err(SessionError::LoginFailed(
                "login_success carried no token info".to_string(),
            )),
            Frame::LoginFailed { error_msg, .. } => {
                Err(SessionError::AuthenticationFailed(error_msg))
            }
            other => Err(SessionError::LoginFailed(format!(
                "unexpected {} reply",
                other.kind()
            ))),
        }
    }

    async fn close_all(&self) {
        let remaining = self.registry.drain();
        if !remaining.is_empty() {
            tracing::debug!("Closing {} local connections", remaining.len());
        }
        for (_, conn) in remaining {
            conn.close().await;
        }
    }
}
