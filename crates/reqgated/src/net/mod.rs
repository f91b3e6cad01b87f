//! TCP plumbing for the daemon: accepted-connection handles and bound
//! listeners.

mod listener;
mod socket;

pub use self::listener::BindError;
pub(crate) use self::listener::RequestListener;
pub(crate) use self::socket::ClientSocket;

pub(crate) const NET_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::net");
