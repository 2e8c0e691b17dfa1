//! Control channel to the relay server

mod dispatcher;
mod session;
mod writer;

pub use dispatcher::Dispatcher;
pub use session::ControlSession;
pub use writer::{run_writer, spawn_writer, FrameSender, OUTBOUND_CHANNEL_CAPACITY};
