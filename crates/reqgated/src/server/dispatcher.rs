//! Top-level controller: accepts connections on the configured listeners,
//! spawns a [`ConnectionWorker`] per socket, reaps dead workers, and drives
//! orderly teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::{debug, info, warn};

use reqgate_config::Config;

use crate::net::{BindError, RequestListener};
use crate::queue::{DispatchQueue, QueueSender};
use crate::wake::{WakeChannel, WakeChannelError};

use super::SERVER_TARGET;
use super::connection::ConnectionWorker;

/// Poll interval for the accept loop; each timeout runs the reaper.
const WAIT_INTERVAL_MS: u16 = 1000;

/// Bound listeners plus the accept-loop thread and its worker registry.
///
/// The registry of live connections is owned by the accept-loop thread and
/// mutated only there (append on accept, removal on reap); teardown takes it
/// back by joining the thread.
#[derive(Debug)]
pub struct Dispatcher {
    wake: Arc<WakeChannel>,
    queue: DispatchQueue,
    plain_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    handle: Option<thread::JoinHandle<Vec<ConnectionWorker>>>,
}

impl Dispatcher {
    /// Binds the configured listeners and starts the accept loop.
    ///
    /// The plain listener is always bound; the HTTP listener only when a
    /// positive HTTP port is configured. Either bind failure is fatal and
    /// propagated.
    ///
    /// `sender` is the producer half connection threads push onto; it moves
    /// into the accept loop and is dropped at teardown, so once
    /// [`Dispatcher::shutdown`] returns the matching [`DispatchQueue`] has no
    /// producers left (callers keeping their own [`QueueSender`] clones
    /// extend that).
    pub fn start(
        config: &Config,
        queue: &DispatchQueue,
        sender: QueueSender,
    ) -> Result<Self, DispatcherError> {
        let plain = RequestListener::bind(&config.plain_endpoint(), config.backlog())
            .map_err(DispatcherError::Bind)?;
        let mut listeners = vec![Listener {
            socket: plain,
            is_http: false,
        }];
        if let Some(endpoint) = config.http_endpoint() {
            let http =
                RequestListener::bind(&endpoint, config.backlog()).map_err(DispatcherError::Bind)?;
            listeners.push(Listener {
                socket: http,
                is_http: true,
            });
        }
        let plain_addr = listeners[0].socket.local_addr();
        let http_addr = listeners.get(1).and_then(|l| l.socket.local_addr());

        let wake = Arc::new(WakeChannel::new().map_err(DispatcherError::Wake)?);
        let loop_wake = Arc::clone(&wake);
        let handle = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || run_accept_loop(&loop_wake, &listeners, &sender))
            .map_err(|source| DispatcherError::Thread { source })?;

        Ok(Self {
            wake,
            queue: queue.clone(),
            plain_addr,
            http_addr,
            handle: Some(handle),
        })
    }

    /// Bound address of the plain listener.
    #[must_use]
    pub fn plain_addr(&self) -> Option<SocketAddr> {
        self.plain_addr
    }

    /// Bound address of the HTTP listener, when enabled.
    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Runs the teardown path.
    ///
    /// Signals the accept loop and collects its worker registry, fails every
    /// request still sitting in the dispatch queue so no connection thread
    /// stays blocked, then signals and joins each connection thread. Joining
    /// drops the last producer handles, so consumers blocked in
    /// [`DispatchQueue::next`] are released with `None` on return.
    pub fn shutdown(mut self) {
        info!(target: SERVER_TARGET, "dispatcher shutting down");
        self.wake.notify();
        let connections = match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!(target: SERVER_TARGET, "dispatcher thread panicked");
                Vec::new()
            }),
            None => Vec::new(),
        };

        // Queued-but-unserviced requests must be failed before any worker
        // join: a worker blocked in wait_for_result cannot terminate until
        // its request is resolved.
        self.queue.drain_pending();

        for connection in connections {
            connection.stop();
            connection.join();
        }
        info!(target: SERVER_TARGET, "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.wake.notify();
    }
}

/// Errors surfaced while constructing the dispatcher; fatal at startup.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// A listener could not be bound.
    #[error(transparent)]
    Bind(BindError),
    /// The wake channel could not be created.
    #[error(transparent)]
    Wake(WakeChannelError),
    /// The OS refused to spawn the accept-loop thread.
    #[error("failed to spawn dispatcher thread: {source}")]
    Thread {
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct Listener {
    socket: RequestListener,
    is_http: bool,
}

fn run_accept_loop(
    wake: &WakeChannel,
    listeners: &[Listener],
    queue: &QueueSender,
) -> Vec<ConnectionWorker> {
    for listener in listeners {
        info!(
            target: SERVER_TARGET,
            endpoint = %listener.socket.endpoint(),
            http = listener.is_http,
            "listening"
        );
    }

    let mut connections: Vec<ConnectionWorker> = Vec::new();
    let mut next_id: u64 = 0;

    loop {
        let error_flags = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        let mut fds = Vec::with_capacity(listeners.len() + 1);
        fds.push(PollFd::new(wake.watch_fd(), PollFlags::POLLIN));
        for listener in listeners {
            fds.push(PollFd::new(listener.socket.poll_fd(), PollFlags::POLLIN));
        }

        let ready = match poll(&mut fds, PollTimeout::from(WAIT_INTERVAL_MS)) {
            Ok(ready) => ready,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                warn!(target: SERVER_TARGET, error = %errno, "accept loop poll failed");
                break;
            }
        };
        if ready == 0 {
            reap(&mut connections);
            continue;
        }
        if fds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .intersects(PollFlags::POLLIN | error_flags)
        {
            debug!(target: SERVER_TARGET, "accept loop received shutdown notification");
            break;
        }

        let ready_listeners: Vec<bool> = fds[1..]
            .iter()
            .map(|fd| {
                fd.revents()
                    .unwrap_or(PollFlags::empty())
                    .contains(PollFlags::POLLIN)
            })
            .collect();
        drop(fds);

        for (listener, _) in listeners
            .iter()
            .zip(&ready_listeners)
            .filter(|(_, ready)| **ready)
        {
            let Some(socket) = listener.socket.accept_one() else {
                continue;
            };
            next_id += 1;
            match ConnectionWorker::spawn(next_id, socket, listener.is_http, queue.clone()) {
                Ok(connection) => {
                    info!(
                        target: SERVER_TARGET,
                        id = connection.id(),
                        http = listener.is_http,
                        "new connection"
                    );
                    connections.push(connection);
                }
                Err(error) => {
                    warn!(target: SERVER_TARGET, error = %error, "failed to start connection");
                }
            }
        }
    }

    connections
}

/// Removes registry entries whose threads have already terminated.
fn reap(connections: &mut Vec<ConnectionWorker>) {
    let before = connections.len();
    let (dead, live): (Vec<_>, Vec<_>) = connections
        .drain(..)
        .partition(ConnectionWorker::is_finished);
    *connections = live;
    for connection in dead {
        connection.join();
    }
    let removed = before - connections.len();
    if removed > 0 {
        debug!(target: SERVER_TARGET, removed, "reaped dead connections");
    }
}
