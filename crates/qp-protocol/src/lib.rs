//! qp-protocol: Wire protocol for the QuickPort relay control channel
//!
//! This crate defines the newline-delimited JSON frames exchanged between
//! the relay server and the client over the single control socket.

pub mod codec;
pub mod conn_id;
pub mod error;
pub mod frame;
pub mod serde_utils;
pub mod token;

pub use codec::{FrameCodec, MAX_FRAME_LENGTH};
pub use conn_id::ConnId;
pub use error::ProtocolError;
pub use frame::{Frame, FrameKind, LOGIN_PAYLOAD};
pub use token::TokenInfo;
