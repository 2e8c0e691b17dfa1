//! Registry of open local connections
//!
//! Maps each connection id the relay assigned to the local socket serving
//! it. An id is present from `new_conn` until its local socket is closed:
//! whoever removes an entry is responsible for closing it, and does so
//! after the shard lock has been released.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use qp_protocol::ConnId;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Registry invariant violations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The relay announced an id that is still open
    #[error("Connection id already registered: {0}")]
    DuplicateId(ConnId),
}

/// Write side of a local socket
enum WriterState {
    /// Local dial in progress; payloads from the relay queue here
    Pending(Vec<Bytes>),
    /// Connected to the local service
    Open(BoxedWriter),
    /// Shut down or abandoned
    Closed,
}

struct Shared {
    state: Mutex<WriterState>,
    open: AtomicBool,
}

/// Handle to the write side of a local socket plus its forwarder's
/// cancellation token.
///
/// Clones share the same socket. Each handle carries a process-unique
/// serial, so a stale forwarder can tell its own entry apart from a newer
/// connection that reuses the id.
///
/// A handle may be registered before the local dial finishes. Payloads
/// written in the meantime are buffered and flushed in order by
/// [`attach`](Self::attach). Every write gives up as soon as the token is
/// cancelled, so closing never waits on a local service that stopped
/// reading.
#[derive(Clone)]
pub struct LocalConnection {
    serial: u64,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl LocalConnection {
    /// Wrap the write half of an already connected local socket
    pub fn new<W>(writer: W, cancel: CancellationToken) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self::with_state(WriterState::Open(Box::pin(writer)), true, cancel)
    }

    /// Handle for a connection whose local dial has not finished yet
    pub fn pending(cancel: CancellationToken) -> Self {
        Self::with_state(WriterState::Pending(Vec::new()), false, cancel)
    }

    fn with_state(state: WriterState, open: bool, cancel: CancellationToken) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                open: AtomicBool::new(open),
            }),
            cancel,
        }
    }

    /// Serial distinguishing this socket from others with the same id
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Token that stops this connection's forwarder
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the local socket is connected and not yet closed
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Install the dialed socket and flush everything buffered while pending
    pub async fn attach<W>(&self, writer: W) -> io::Result<()>
    where
        W: AsyncWrite + Send + 'static,
    {
        let mut writer: BoxedWriter = Box::pin(writer);
        let mut state = self.shared.state.lock().await;

        let buffered = match &mut *state {
            WriterState::Pending(buffered) => std::mem::take(buffered),
            WriterState::Open(_) | WriterState::Closed => {
                let _ = writer.shutdown().await;
                return Err(io::ErrorKind::NotConnected.into());
            }
        };
        write_chunks(&mut writer, &buffered, &self.cancel).await?;

        *state = WriterState::Open(writer);
        self.shared.open.store(true, Ordering::Release);
        Ok(())
    }

    /// Write a payload received from the relay to the local service
    pub async fn write_all(&self, data: Bytes) -> io::Result<()> {
        let mut state = self.shared.state.lock().await;
        match &mut *state {
            WriterState::Pending(buffered) => {
                buffered.push(data);
                Ok(())
            }
            WriterState::Open(writer) => {
                write_chunks(writer, std::slice::from_ref(&data), &self.cancel).await
            }
            WriterState::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Stop the forwarder and shut the local socket down.
    ///
    /// Payloads still buffered behind a pending dial are discarded.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.shared.open.store(false, Ordering::Release);

        let mut state = self.shared.state.lock().await;
        if let WriterState::Open(writer) = &mut *state {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!("Local socket shutdown error: {}", e);
            }
        }
        *state = WriterState::Closed;
    }
}

async fn write_chunks(
    writer: &mut BoxedWriter,
    chunks: &[Bytes],
    cancel: &CancellationToken,
) -> io::Result<()> {
    let write = async {
        for chunk in chunks {
            writer.write_all(chunk).await?;
        }
        writer.flush().await
    };

    tokio::select! {
        result = write => result,
        _ = cancel.cancelled() => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "local connection closed",
        )),
    }
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("serial", &self.serial)
            .field("open", &self.is_open())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Concurrent map of open logical connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnId, LocalConnection>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a newly opened local socket
    pub fn put(&self, id: ConnId, conn: LocalConnection) -> Result<(), RegistryError> {
        match self.connections.entry(id) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(conn);
                Ok(())
            }
        }
    }

    /// Get the socket for a connection id
    pub fn get(&self, id: &ConnId) -> Option<LocalConnection> {
        self.connections.get(id).map(|r| r.value().clone())
    }

    /// Remove a connection; the caller closes the returned socket
    pub fn remove(&self, id: &ConnId) -> Option<LocalConnection> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    /// Remove `id` only if it still refers to `conn`
    pub fn remove_entry(&self, id: &ConnId, conn: &LocalConnection) -> Option<LocalConnection> {
        self.connections
            .remove_if(id, |_, current| current.serial == conn.serial)
            .map(|(_, conn)| conn)
    }

    /// Check whether a connection id is registered
    pub fn contains(&self, id: &ConnId) -> bool {
        self.connections.contains_key(id)
    }

    /// Ids of all open connections
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }

    /// Remove every connection, returning them for closing
    pub fn drain(&self) -> Vec<(ConnId, LocalConnection)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.connections.remove(&id))
            .collect()
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connection is open
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
