//! Frame types for the QuickPort control channel
//!
//! Every message on the control socket is a single JSON object whose `type`
//! field selects the variant. The relay emits every field on every message
//! (empty strings where a field does not apply), so decoding ignores fields
//! that a variant does not carry.
//!
//! # Message Flow
//!
//! 1. Client connects and sends `login` with its token
//! 2. Relay answers with exactly one `login_success` or `login_failed`
//! 3. For each public inbound connection the relay sends `new_conn`
//! 4. Bytes flow both ways as `data` frames keyed by `conn_id`
//! 5. Either side ends a logical connection with `close`
//! 6. The relay may end the whole session with `kick`

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::conn_id::ConnId;
use crate::serde_utils::base64_bytes;
use crate::token::TokenInfo;

/// Payload sent along with `login`: an empty JSON object
pub const LOGIN_PAYLOAD: &[u8] = b"{}";

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client authentication request
    Login {
        token: String,
        #[serde(default, with = "base64_bytes")]
        data: Bytes,
    },

    /// Relay accepted the token
    LoginSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_info: Option<TokenInfo>,
        /// Optional informational message from the relay
        #[serde(
            default,
            with = "base64_bytes",
            skip_serializing_if = "base64_bytes::is_empty"
        )]
        data: Bytes,
    },

    /// Relay rejected the token
    LoginFailed {
        #[serde(default)]
        error_msg: String,
        #[serde(
            default,
            with = "base64_bytes",
            skip_serializing_if = "base64_bytes::is_empty"
        )]
        data: Bytes,
    },

    /// A public client connected to the proxy named `proxy_name`
    NewConn { proxy_name: String, conn_id: ConnId },

    /// Bytes for one logical connection
    Data {
        conn_id: ConnId,
        #[serde(default, with = "base64_bytes")]
        data: Bytes,
    },

    /// End of one logical connection
    Close { conn_id: ConnId },

    /// The relay is terminating this session
    Kick,

    /// Any `type` this client does not understand
    #[serde(other)]
    Unknown,
}

/// Discriminant of a [`Frame`], for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Login,
    LoginSuccess,
    LoginFailed,
    NewConn,
    Data,
    Close,
    Kick,
    Unknown,
}

impl FrameKind {
    /// Wire name of the frame type
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Login => "login",
            FrameKind::LoginSuccess => "login_success",
            FrameKind::LoginFailed => "login_failed",
            FrameKind::NewConn => "new_conn",
            FrameKind::Data => "data",
            FrameKind::Close => "close",
            FrameKind::Kick => "kick",
            FrameKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Frame {
    /// Build the login request for `token`
    pub fn login(token: impl Into<String>) -> Self {
        Frame::Login {
            token: token.into(),
            data: Bytes::from_static(LOGIN_PAYLOAD),
        }
    }

    /// Build a data frame
    pub fn data(conn_id: ConnId, data: Bytes) -> Self {
        Frame::Data { conn_id, data }
    }

    /// Build a close frame
    pub fn close(conn_id: ConnId) -> Self {
        Frame::Close { conn_id }
    }

    /// Get the kind of this frame
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Login { .. } => FrameKind::Login,
            Frame::LoginSuccess { .. } => FrameKind::LoginSuccess,
            Frame::LoginFailed { .. } => FrameKind::LoginFailed,
            Frame::NewConn { .. } => FrameKind::NewConn,
            Frame::Data { .. } => FrameKind::Data,
            Frame::Close { .. } => FrameKind::Close,
            Frame::Kick => FrameKind::Kick,
            Frame::Unknown => FrameKind::Unknown,
        }
    }
}
