//! Authenticated token metadata
//!
//! The relay attaches this record to `login_success`. It describes the one
//! proxy the token grants: which local service to forward to and which
//! public port the relay exposes it on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of an authenticated token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenInfo {
    /// The token as issued
    pub token_raw: String,
    /// Account the token belongs to
    pub email: String,
    /// Issue time
    pub created_at: Option<DateTime<Utc>>,
    /// Expiry time
    pub expire_at: Option<DateTime<Utc>>,
    /// Port of the local service to expose
    pub local_port: u16,
    /// Address of the local service to expose
    pub local_ip: String,
    /// Proxy protocol, e.g. "tcp"
    pub protocol_type: String,
    /// Free-form bandwidth limit description
    pub bandwidth_limit: String,
    /// Public port allocated on the relay
    pub remote_port: u16,
}
