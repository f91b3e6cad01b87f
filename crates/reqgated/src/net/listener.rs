//! Bound TCP listener producing [`ClientSocket`] handles.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, bind, listen, setsockopt, socket,
    sockopt,
};
use tracing::{debug, warn};

use reqgate_config::{EndpointError, TcpEndpoint};

use super::NET_TARGET;
use super::socket::ClientSocket;

/// Listening socket for one configured endpoint.
///
/// The accept socket is non-blocking; callers drive it from a poll loop and
/// call [`RequestListener::accept_one`] only when the descriptor is marked
/// readable.
#[derive(Debug)]
pub(crate) struct RequestListener {
    endpoint: TcpEndpoint,
    listener: TcpListener,
}

impl RequestListener {
    /// Binds and starts listening on the endpoint.
    ///
    /// `SO_REUSEADDR` is applied before binding so restarts do not trip over
    /// sockets lingering in TIME_WAIT. Failure here is fatal to the caller.
    pub(crate) fn bind(endpoint: &TcpEndpoint, backlog: u16) -> Result<Self, BindError> {
        let addr = endpoint
            .socket_addr()
            .map_err(|source| BindError::Endpoint { source })?;
        let os_error = |source: Errno| BindError::Bind {
            endpoint: endpoint.clone(),
            source,
        };

        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .map_err(os_error)?;
        setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(os_error)?;
        bind(fd.as_raw_fd(), &SockaddrIn::from(addr)).map_err(os_error)?;
        let backlog = Backlog::new(i32::from(backlog)).unwrap_or(Backlog::MAXCONN);
        listen(&fd, backlog).map_err(os_error)?;

        let listener = TcpListener::from(fd);
        listener
            .set_nonblocking(true)
            .map_err(|source| BindError::NonBlocking {
                endpoint: endpoint.clone(),
                source,
            })?;

        debug!(target: NET_TARGET, endpoint = %endpoint, "listener bound");
        Ok(Self {
            endpoint: endpoint.clone(),
            listener,
        })
    }

    /// Endpoint the listener was configured with.
    pub(crate) fn endpoint(&self) -> &TcpEndpoint {
        &self.endpoint
    }

    /// Actual bound address; differs from the endpoint when port 0 was
    /// requested.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Descriptor to place in a poll wait set.
    pub(crate) fn poll_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    /// Accepts one pending connection.
    ///
    /// Intended to be called when the poll handle is readable. Transient
    /// accept failures (including a connection that vanished between poll
    /// and accept) yield `None` rather than an error.
    pub(crate) fn accept_one(&self) -> Option<ClientSocket> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                // The accept socket is non-blocking; the accepted stream must
                // not inherit that.
                if let Err(error) = stream.set_nonblocking(false) {
                    warn!(
                        target: NET_TARGET,
                        endpoint = %self.endpoint,
                        error = %error,
                        "failed to restore blocking mode on accepted stream"
                    );
                    return None;
                }
                debug!(
                    target: NET_TARGET,
                    endpoint = %self.endpoint,
                    peer = %peer,
                    "accepted connection"
                );
                Some(ClientSocket::new(stream))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => None,
            Err(error) => {
                warn!(
                    target: NET_TARGET,
                    endpoint = %self.endpoint,
                    error = %error,
                    "transient accept failure"
                );
                None
            }
        }
    }
}

/// Errors surfaced while binding a listener; fatal at daemon startup.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// The configured endpoint did not resolve to an IPv4 address.
    #[error("invalid listener endpoint: {source}")]
    Endpoint {
        /// Underlying endpoint error.
        #[source]
        source: EndpointError,
    },
    /// Socket creation, binding, or listening failed.
    #[error("failed to bind listener at {endpoint}: {source}")]
    Bind {
        /// Configured endpoint.
        endpoint: TcpEndpoint,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// The accept socket could not be made non-blocking.
    #[error("failed to enable non-blocking accepts at {endpoint}: {source}")]
    NonBlocking {
        /// Configured endpoint.
        endpoint: TcpEndpoint,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    use super::*;

    fn loopback_listener() -> RequestListener {
        RequestListener::bind(&TcpEndpoint::new("127.0.0.1", 0), 5).expect("bind listener")
    }

    fn wait_readable(listener: &RequestListener) -> bool {
        let mut fds = [PollFd::new(listener.poll_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::from(2000u16)).expect("poll listener") == 1
    }

    #[test]
    fn accepts_connection_when_readable() {
        let listener = loopback_listener();
        let addr = listener.local_addr().expect("bound address");

        assert!(listener.accept_one().is_none(), "no pending connection yet");

        let client = thread::spawn(move || TcpStream::connect(addr).expect("connect"));
        assert!(wait_readable(&listener));
        let accepted = listener.accept_one().expect("accept connection");
        assert!(accepted.is_valid());
        drop(client.join().expect("join client"));
    }

    #[test]
    fn rebinding_an_occupied_port_fails() {
        let listener = loopback_listener();
        let addr = listener.local_addr().expect("bound address");

        let clash = RequestListener::bind(&TcpEndpoint::new("127.0.0.1", addr.port()), 5);
        assert!(matches!(clash, Err(BindError::Bind { .. })));
    }

    #[test]
    fn accepted_stream_blocks_for_reads() {
        let listener = loopback_listener();
        let addr = listener.local_addr().expect("bound address");
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            thread::sleep(Duration::from_millis(50));
            use std::io::Write;
            stream.write_all(b"late\n").expect("write");
            stream
        });

        assert!(wait_readable(&listener));
        let mut accepted = listener.accept_one().expect("accept connection");
        // A non-blocking stream would fail with WouldBlock here instead of
        // waiting for the delayed write.
        assert_eq!(accepted.recv(1024).expect("recv"), "late\n");
        drop(client.join().expect("join client"));
    }
}
