//! Session status published to the presentation layer
//!
//! The session manager owns a [`StatusPublisher`]; any number of observers
//! hold a `watch::Receiver<SessionStatus>` and see every transition without
//! touching session internals.

use std::sync::Arc;

use tokio::sync::watch;

/// Snapshot of the client's externally visible state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// Logged in and serving
    pub active: bool,
    /// Public address of the proxy, e.g. `relay.example.com:30001`
    pub public_addr: Option<String>,
    /// Human-readable `local <-----> public` route
    pub route: Option<String>,
    /// The proxy is meant to be running; cleared by kick or shutdown
    pub proxy_running: bool,
}

/// Write side of the status channel
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<SessionStatus>>,
}

impl StatusPublisher {
    /// Create a publisher with the initial (disconnected) status
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionStatus::default());
        Self { tx: Arc::new(tx) }
    }

    /// Get a receiver for status updates
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Get the current status
    pub fn current(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    /// Mark the proxy as started or stopped
    pub fn set_running(&self, running: bool) {
        self.tx.send_if_modified(|status| {
            let changed = status.proxy_running != running;
            status.proxy_running = running;
            changed
        });
    }

    /// Publish a successful login
    pub fn activate(&self, public_addr: String, route: String) {
        self.tx.send_modify(|status| {
            status.active = true;
            status.public_addr = Some(public_addr);
            status.route = Some(route);
            status.proxy_running = true;
        });
    }

    /// Revoke the active status after a session ends
    pub fn revoke(&self) {
        self.tx.send_if_modified(|status| {
            let changed = status.active || status.public_addr.is_some() || status.route.is_some();
            status.active = false;
            status.public_addr = None;
            status.route = None;
            changed
        });
    }

    /// The relay kicked this client: not active and not running
    pub fn kicked(&self) {
        self.tx.send_modify(|status| {
            status.active = false;
            status.public_addr = None;
            status.route = None;
            status.proxy_running = false;
        });
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}
