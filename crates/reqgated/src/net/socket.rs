//! Thin owned handle over one accepted TCP connection.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::fcntl::{FcntlArg, fcntl};
use thiserror::Error;

/// One accepted connection; owns the descriptor exclusively and closes it on
/// drop.
#[derive(Debug)]
pub(crate) struct ClientSocket {
    stream: TcpStream,
}

impl ClientSocket {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Local address of the connection, used for logging and thread names.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    /// Descriptor to place in a poll wait set.
    pub(crate) fn poll_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    /// Liveness probe that consumes no data: checks the descriptor still
    /// answers `fcntl(F_GETFL)`.
    pub(crate) fn is_valid(&self) -> bool {
        fcntl(self.stream.as_raw_fd(), FcntlArg::F_GETFL).is_ok()
    }

    /// Applies `timeout` to both the read and write directions.
    pub(crate) fn set_timeout(&self, timeout: Duration) -> Result<(), SocketIoError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| self.stream.set_write_timeout(Some(timeout)))
            .map_err(|source| SocketIoError::Configure { source })
    }

    /// Writes the text to the peer, returning the number of bytes sent.
    ///
    /// The wire protocol is ASCII, so the UTF-8 byte view is the wire form.
    pub(crate) fn send(&mut self, text: &str) -> Result<usize, SocketIoError> {
        self.stream
            .write(text.as_bytes())
            .map_err(|source| SocketIoError::Send { source })
    }

    /// Reads up to `max_bytes` from the peer.
    ///
    /// An empty string signals orderly peer close. Interrupted reads are
    /// retried.
    pub(crate) fn recv(&mut self, max_bytes: usize) -> Result<String, SocketIoError> {
        let mut buffer = vec![0_u8; max_bytes];
        loop {
            match self.stream.read(&mut buffer) {
                Ok(read) => {
                    return Ok(String::from_utf8_lossy(&buffer[..read]).into_owned());
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(SocketIoError::Recv { source }),
            }
        }
    }
}

/// I/O failures on an individual connection.
///
/// These are contained within the owning connection thread; they terminate
/// that one connection and never escape to the dispatcher.
#[derive(Debug, Error)]
pub(crate) enum SocketIoError {
    /// Applying socket timeouts failed.
    #[error("failed to configure socket timeouts: {source}")]
    Configure {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing to the peer failed.
    #[error("failed to send to peer: {source}")]
    Send {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading from the peer failed.
    #[error("failed to receive from peer: {source}")]
    Recv {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
