//! Cross-thread wakeup primitive for poll-based wait loops.
//!
//! Each thread that blocks in [`nix::poll::poll`] owns a `WakeChannel` and
//! places its read side in the wait set. Any other thread holding a reference
//! can interrupt the wait by writing a byte to the non-blocking write side.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd;
use thiserror::Error;

/// Pipe-backed notification channel usable inside a poll wait set.
///
/// Notifying is edge-sufficient: a writer may call [`WakeChannel::notify`]
/// any number of times and the reader need only observe the read side
/// becoming readable once per wait cycle.
#[derive(Debug)]
pub(crate) struct WakeChannel {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl WakeChannel {
    /// Creates the underlying pipe with a non-blocking write side.
    ///
    /// Creation failure is the only fatal outcome; it aborts construction of
    /// the owning component.
    pub(crate) fn new() -> Result<Self, WakeChannelError> {
        let (read_end, write_end) =
            unistd::pipe().map_err(|source| WakeChannelError::Create { source })?;
        fcntl(write_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|source| WakeChannelError::Configure { source })?;
        Ok(Self {
            read_end,
            write_end,
        })
    }

    /// Writes one notification byte without blocking.
    ///
    /// Returns the number of bytes written; 0 (pipe already full) still
    /// leaves the read side readable, so both outcomes signal successfully.
    pub(crate) fn notify(&self) -> usize {
        unistd::write(&self.write_end, b"1").unwrap_or(0)
    }

    /// Read-side descriptor to place in a poll wait set.
    pub(crate) fn watch_fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }
}

/// Errors raised while setting up a [`WakeChannel`].
#[derive(Debug, Error)]
pub enum WakeChannelError {
    /// The pipe could not be created.
    #[error("failed to create wake pipe: {source}")]
    Create {
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// The write side could not be made non-blocking.
    #[error("failed to configure wake pipe: {source}")]
    Configure {
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
}
