//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A single frame exceeds the maximum line length
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame body is not a valid JSON message
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
