//! qp-client: QuickPort relay client
//!
//! The client opens one control connection to the relay server, logs in
//! with a token, and then forwards every logical connection the relay
//! announces to the local service described by the token.

pub mod error;
pub mod local;
pub mod proxy;
pub mod status;
pub mod tunnel;

pub use error::{ForwardError, SessionError};
pub use local::{ConnectionRegistry, LocalConnection, RegistryError};
pub use proxy::ProxyConfig;
pub use status::{SessionStatus, StatusPublisher};
pub use tunnel::{ControlSession, Dispatcher, FrameSender};
