//! Network front-end serialising client requests into a single worker queue.
//!
//! The daemon accepts raw-line TCP connections and minimal HTTP/1.x
//! connections, frames each connection's byte stream into discrete request
//! strings, and pushes them onto one thread-safe FIFO — the dispatch queue —
//! consumed by a single external worker. Each result is routed back to the
//! exact connection that issued the matching request; a connection left in
//! listening mode keeps receiving pushed updates until the worker asks for a
//! disconnect.
//!
//! Scheduling is one OS thread per accepted connection plus one accept-loop
//! thread; every wait is either a poll(2) readiness wait or a condition-wait
//! on a pending result. Pipe-backed wake channels interrupt the poll waits
//! for shutdown.
//!
//! Embedders create a [`DispatchQueue`](queue::DispatchQueue), hand its
//! [`QueueSender`](queue::QueueSender) to a
//! [`Dispatcher`](server::Dispatcher), and consume requests from the
//! receiving half until it disconnects; the `reqgated` binary wires a
//! trivial echo worker instead.

mod net;
pub mod pending;
mod process;
pub mod queue;
pub mod server;
pub mod telemetry;
mod wake;

pub use net::BindError;
pub use pending::PendingRequest;
pub use process::{LaunchError, ShutdownError, ShutdownSignal, SystemShutdownSignal, run, run_with};
pub use queue::{DispatchQueue, QueueSender, SHUTDOWN_RESULT};
pub use server::{Dispatcher, DispatcherError};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use wake::WakeChannelError;
