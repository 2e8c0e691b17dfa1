//! Client error types

use thiserror::Error;

use qp_protocol::ProtocolError;

/// Reasons a control session ends
///
/// Every variant is recovered by the session loop: it waits the reconnect
/// delay and starts over from `connect()`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The relay server could not be reached
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The relay rejected the token
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The login exchange did not produce a usable reply
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Malformed frame or control socket I/O failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The relay closed the control socket
    #[error("Server closed connection")]
    ServerClosed,

    /// The relay sent `kick`
    #[error("Kicked by server")]
    Kicked,

    /// Local shutdown was requested
    #[error("Session shut down")]
    Shutdown,
}

/// Failures reaching the local service for a new logical connection
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The local service refused or failed the connection
    #[error("Failed to connect to local service {addr}: {source}")]
    LocalDial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The local service did not accept within the configured timeout
    #[error("Timed out connecting to local service {0}")]
    DialTimeout(String),
}
