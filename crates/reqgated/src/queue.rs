//! The dispatch queue carrying framed requests from every connection to the
//! external worker.
//!
//! All connection threads are producers; the worker is the sole consumer
//! during normal operation. On shutdown the dispatcher drains whatever is
//! still queued so no connection thread is left blocked on a result that
//! will never arrive.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::debug;

use crate::pending::PendingRequest;

pub(crate) const QUEUE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::queue");

/// Result text posted to requests abandoned by a shutdown drain.
pub const SHUTDOWN_RESULT: &str = "ERR: shutdown";

/// Consuming half of the FIFO between the connection threads and the worker.
///
/// Holds only the receiving end: producer handles are [`QueueSender`] values
/// cloned from the one returned by [`DispatchQueue::new`]. Keeping the halves
/// apart is what lets [`DispatchQueue::next`] observe disconnection — a queue
/// that held its own sender could never run out of producers.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    receiver: Receiver<Arc<PendingRequest>>,
}

impl DispatchQueue {
    /// Creates an empty unbounded queue and its first producer handle.
    #[must_use]
    pub fn new() -> (Self, QueueSender) {
        let (sender, receiver) = unbounded();
        (Self { receiver }, QueueSender { sender })
    }

    /// Blocks until the next request is available.
    ///
    /// Returns `None` once the queue is empty and every producer handle has
    /// been dropped, which is how a consumer loop observes shutdown.
    #[must_use]
    pub fn next(&self) -> Option<Arc<PendingRequest>> {
        self.receiver.recv().ok()
    }

    /// Waits up to `timeout` for the next request.
    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<Arc<PendingRequest>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Fails every request still sitting in the queue.
    ///
    /// Each one receives the shutdown sentinel with `disconnect` set, which
    /// releases its blocked connection thread. Returns the number of
    /// requests drained.
    pub(crate) fn drain_pending(&self) -> usize {
        let mut drained = 0;
        while let Ok(message) = self.receiver.try_recv() {
            message.post_result(SHUTDOWN_RESULT, false, None, true);
            drained += 1;
        }
        if drained > 0 {
            debug!(target: QUEUE_TARGET, drained, "failed queued requests on shutdown");
        }
        drained
    }
}

/// Cloneable producer handle held by each connection thread.
///
/// Dropping the last clone disconnects the queue and releases any consumer
/// blocked in [`DispatchQueue::next`].
#[derive(Debug, Clone)]
pub struct QueueSender {
    sender: Sender<Arc<PendingRequest>>,
}

impl QueueSender {
    /// Queues a completed request for the worker.
    ///
    /// Returns `false` when the consuming side is gone; the caller treats
    /// that as connection-terminating, since no result can ever arrive.
    pub(crate) fn push(&self, message: Arc<PendingRequest>) -> bool {
        self.sender.send(message).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn requests_are_delivered_in_fifo_order() {
        let (queue, sender) = DispatchQueue::new();

        for text in ["a\n", "b\n", "c\n"] {
            let message = Arc::new(PendingRequest::new(false));
            message.add_fragment(text);
            assert!(sender.push(message));
        }

        let order: Vec<String> = (0..3)
            .map(|_| queue.next().expect("queued request").request_text())
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[rstest]
    fn next_timeout_expires_on_an_empty_queue() {
        let (queue, _sender) = DispatchQueue::new();
        assert!(queue.next_timeout(Duration::from_millis(20)).is_none());
    }

    #[rstest]
    fn next_disconnects_once_every_producer_is_dropped() {
        let (queue, sender) = DispatchQueue::new();
        let message = Arc::new(PendingRequest::new(false));
        message.add_fragment("last\n");
        assert!(sender.push(message));
        drop(sender);

        // The queued request is still delivered; only then does the empty,
        // producerless channel report disconnection.
        assert!(queue.next().is_some());
        assert!(queue.next().is_none());
    }

    #[rstest]
    fn drain_posts_shutdown_result_to_everything_queued() {
        let (queue, sender) = DispatchQueue::new();

        let first = Arc::new(PendingRequest::new(false));
        first.add_fragment("stuck\n");
        let second = Arc::new(PendingRequest::new(true));
        sender.push(Arc::clone(&first));
        sender.push(Arc::clone(&second));

        assert_eq!(queue.drain_pending(), 2);
        for message in [first, second] {
            assert_eq!(message.wait_for_result(), SHUTDOWN_RESULT);
            assert!(message.is_disconnect());
        }
    }
}
