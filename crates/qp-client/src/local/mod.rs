//! Local side of the tunnel: open sockets to the forwarded service

mod forwarder;
mod registry;

pub use forwarder::{dial_local, spawn_connect, spawn_forwarder, READ_CHUNK_SIZE};
pub use registry::{ConnectionRegistry, LocalConnection, RegistryError};
