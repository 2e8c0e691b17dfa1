//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Fixed delay between the end of one session and the next connect attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Hostname the relay exposes proxied ports on
pub const DEFAULT_PUBLIC_HOST: &str = "quickport.natyosu.com";

/// Configuration for the relay client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay server control address (host:port)
    pub server_address: String,

    /// Opaque credential issued by the account service
    pub token: String,

    /// Public hostname used when rendering the public address and route
    pub public_host: String,

    /// Delay before reconnecting after a failed or ended session
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Upper bound on dialing the local service for a new connection
    #[serde(with = "duration_secs")]
    pub local_connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:5555".to_string(),
            token: String::new(),
            public_host: DEFAULT_PUBLIC_HOST.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            local_connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Check that the configuration can start a session
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingField("token".to_string()));
        }

        match self.server_address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
            _ => Err(ConfigError::Invalid(format!(
                "server_address '{}' must be host:port",
                self.server_address
            ))),
        }
    }

    /// Token with everything but the first few characters masked, for logs
    pub fn masked_token(&self) -> String {
        let visible: String = self.token.chars().take(5).collect();
        format!("{}***************", visible)
    }
}
