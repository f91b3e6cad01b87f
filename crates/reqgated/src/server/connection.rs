//! One thread per accepted connection: reads bytes, frames requests, queues
//! them for the worker, and writes results back to the originating socket.

use std::io;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::net::ClientSocket;
use crate::pending::PendingRequest;
use crate::queue::QueueSender;
use crate::wake::{WakeChannel, WakeChannelError};

use super::SERVER_TARGET;

/// Poll interval for the connection loop.
///
/// This is not a protocol idle timeout: it bounds how long the thread can go
/// without re-checking its wake channel and, in listening mode, how often an
/// empty heartbeat re-queues the request for pushed updates.
const WAIT_INTERVAL_MS: u16 = 2000;

/// Bytes requested per socket read.
const READ_CHUNK: usize = 1024;

/// Handle to a running connection thread.
///
/// The thread owns the socket and the framer; the handle keeps the shared
/// wake channel so the dispatcher can interrupt the poll loop, and the join
/// handle so the reaper can observe termination.
#[derive(Debug)]
pub(crate) struct ConnectionWorker {
    id: u64,
    wake: Arc<WakeChannel>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ConnectionWorker {
    /// Spawns the connection thread.
    ///
    /// `id` comes from the dispatcher's counter; `is_http` tags the framing
    /// variant of the listener that accepted the socket.
    pub(crate) fn spawn(
        id: u64,
        socket: ClientSocket,
        is_http: bool,
        queue: QueueSender,
    ) -> Result<Self, ConnectionSpawnError> {
        let wake = Arc::new(WakeChannel::new().map_err(ConnectionSpawnError::Wake)?);
        let thread_wake = Arc::clone(&wake);
        let name = match socket.local_addr() {
            Some(addr) => format!("connection-{id}@{addr}"),
            None => format!("connection-{id}"),
        };
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_connection(id, &thread_wake, socket, is_http, &queue))
            .map_err(|source| ConnectionSpawnError::Thread { source })?;
        Ok(Self {
            id,
            wake,
            handle: Some(handle),
        })
    }

    /// Identity assigned at construction.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Signals the connection thread to terminate at its next poll cycle.
    pub(crate) fn stop(&self) {
        self.wake.notify();
    }

    /// Whether the connection thread has already terminated.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(thread::JoinHandle::is_finished)
    }

    /// Waits for the connection thread to terminate.
    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!(target: SERVER_TARGET, id = self.id, "connection thread panicked");
        }
    }
}

/// Errors surfaced while starting a connection thread.
#[derive(Debug, Error)]
pub(crate) enum ConnectionSpawnError {
    /// The wake channel could not be created.
    #[error(transparent)]
    Wake(WakeChannelError),
    /// The OS refused to spawn the thread.
    #[error("failed to spawn connection thread: {source}")]
    Thread {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Outcome of one poll cycle over {wake fd, socket fd}.
struct Readiness {
    shutdown: bool,
    new_data: bool,
    closed: bool,
}

fn wait_readiness(wake: &WakeChannel, socket: &ClientSocket) -> Result<Readiness, Errno> {
    let error_flags = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
    let mut fds = [
        PollFd::new(wake.watch_fd(), PollFlags::POLLIN),
        PollFd::new(socket.poll_fd(), PollFlags::POLLIN),
    ];
    match poll(&mut fds, PollTimeout::from(WAIT_INTERVAL_MS)) {
        Ok(_) => {}
        Err(Errno::EINTR) => {
            return Ok(Readiness {
                shutdown: false,
                new_data: false,
                closed: false,
            });
        }
        Err(errno) => return Err(errno),
    }
    let wake_revents = fds[0].revents().unwrap_or(PollFlags::empty());
    let socket_revents = fds[1].revents().unwrap_or(PollFlags::empty());
    Ok(Readiness {
        shutdown: wake_revents.intersects(PollFlags::POLLIN | error_flags),
        new_data: socket_revents.contains(PollFlags::POLLIN),
        closed: socket_revents.intersects(error_flags),
    })
}

/// The per-connection loop: poll, decode, dispatch, reply.
fn run_connection(
    id: u64,
    wake: &WakeChannel,
    mut socket: ClientSocket,
    is_http: bool,
    queue: &QueueSender,
) {
    let message = Arc::new(PendingRequest::new(is_http));
    let mut closed = false;

    while !closed {
        let readiness = match wait_readiness(wake, &socket) {
            Ok(readiness) => readiness,
            Err(errno) => {
                warn!(target: SERVER_TARGET, id, error = %errno, "poll failed");
                break;
            }
        };
        if readiness.shutdown {
            debug!(target: SERVER_TARGET, id, "shutdown notification received");
            break;
        }
        closed = readiness.closed;

        if readiness.new_data || message.is_listening() {
            if !socket.is_valid() {
                break;
            }
            let mut fragment = String::new();
            if readiness.new_data {
                fragment = match socket.recv(READ_CHUNK) {
                    Ok(data) => data,
                    Err(error) => {
                        warn!(target: SERVER_TARGET, id, error = %error, "receive failed");
                        break;
                    }
                };
                if fragment.is_empty() {
                    break; // orderly close by the peer
                }
                debug!(target: SERVER_TARGET, id, data = ?fragment, "received data");
            }

            if message.add_fragment(&fragment) {
                debug!(target: SERVER_TARGET, id, request = ?message.request_text(), "new request");
                if !queue.push(Arc::clone(&message)) {
                    warn!(target: SERVER_TARGET, id, "dispatch queue is gone");
                    break;
                }
                debug!(target: SERVER_TARGET, id, "waiting for result");
                let result = message.wait_for_result();
                debug!(target: SERVER_TARGET, id, result = ?result, "got result");
                if !socket.is_valid() {
                    break;
                }
                if let Err(error) = socket.send(&result) {
                    warn!(target: SERVER_TARGET, id, error = %error, "send failed");
                    break;
                }
            }

            if message.is_disconnect() || !socket.is_valid() {
                break;
            }
        }
    }

    info!(target: SERVER_TARGET, id, "connection closed");
}
