//! Connection multiplexing: the accept loop and the per-connection threads.

mod connection;
mod dispatcher;

pub use self::dispatcher::{Dispatcher, DispatcherError};

pub(crate) const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");
