//! Logical connection identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned identifier of a logical connection.
///
/// The relay picks the value; the client treats it as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(String);

impl ConnId {
    /// Create a new connection ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
