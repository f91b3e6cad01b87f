//! Request/response rendezvous shared between a connection thread and the
//! worker consuming the dispatch queue.
//!
//! One [`PendingRequest`] is created per connection and reused for every
//! request on it, so the worker side keeps a stable handle for pushing
//! unsolicited updates while the connection is in listening mode. The framer
//! that decides when accumulated bytes form a complete request lives here
//! too, because completeness depends on the listening state guarded by the
//! same lock.

use std::sync::{Condvar, Mutex, PoisonError};

use percent_encoding::percent_decode_str;
use time::OffsetDateTime;

/// Synchronization unit carrying one request cycle at a time.
///
/// The connection thread accumulates request text and blocks in
/// [`PendingRequest::wait_for_result`]; the worker posts exactly one result
/// per cycle with [`PendingRequest::post_result`]. At most one result is
/// outstanding at any time.
#[derive(Debug)]
pub struct PendingRequest {
    is_http: bool,
    state: Mutex<State>,
    result_ready: Condvar,
}

#[derive(Debug, Default)]
struct State {
    request: String,
    result: Option<String>,
    listening: bool,
    listen_since: Option<OffsetDateTime>,
    disconnect: bool,
}

impl PendingRequest {
    /// Creates the rendezvous for one connection.
    ///
    /// `is_http` selects the framing rules for the connection's lifetime.
    #[must_use]
    pub fn new(is_http: bool) -> Self {
        Self {
            is_http,
            state: Mutex::new(State::default()),
            result_ready: Condvar::new(),
        }
    }

    /// Whether this connection speaks the HTTP framing variant.
    #[must_use]
    pub fn is_http(&self) -> bool {
        self.is_http
    }

    /// Snapshot of the accumulated request text.
    #[must_use]
    pub fn request_text(&self) -> String {
        self.lock_state().request.clone()
    }

    /// Whether the connection is currently in listening mode.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.lock_state().listening
    }

    /// Start of the window from which pushed updates have been delivered,
    /// when in listening mode.
    #[must_use]
    pub fn listen_since(&self) -> Option<OffsetDateTime> {
        self.lock_state().listen_since
    }

    /// Whether the last result asked for the connection to be closed.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        self.lock_state().disconnect
    }

    /// Feeds received bytes to the framer.
    ///
    /// Carriage returns are stripped before accumulation. Returns `true`
    /// when a complete request is ready to be queued:
    ///
    /// - plain mode: the first newline terminates the request; anything
    ///   after it is discarded,
    /// - HTTP mode: a blank line terminates the headers; the request text
    ///   is the path of the first line, with the method token and the
    ///   ` HTTP/x.y` suffix removed and percent-escapes decoded,
    /// - no terminator: complete only for the empty-accumulator listening
    ///   heartbeat, which re-queues the request so pushed updates can be
    ///   delivered without new client bytes.
    pub fn add_fragment(&self, fragment: &str) -> bool {
        let mut state = self.lock_state();
        state.request.push_str(&fragment.replace('\r', ""));

        let terminator = if self.is_http { "\n\n" } else { "\n" };
        if state.request.contains(terminator) {
            if self.is_http {
                state.request = decode_http_request_line(&state.request);
            } else if let Some(pos) = state.request.find('\n') {
                state.request.truncate(pos);
            }
            return true;
        }
        state.request.is_empty() && state.listening
    }

    /// Blocks until a result has been posted, then consumes it.
    ///
    /// The accumulator and the result slot are cleared atomically with the
    /// capture, readying the object for the next cycle. Spurious condvar
    /// wakeups never surface: the wait loops until a result exists.
    pub fn wait_for_result(&self) -> String {
        let mut state = self.lock_state();
        loop {
            if let Some(result) = state.result.take() {
                state.request.clear();
                return result;
            }
            state = self
                .result_ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Posts the result for the current cycle and wakes the waiting
    /// connection thread.
    ///
    /// All four output fields are updated under one lock acquisition so the
    /// waiter observes a consistent cycle outcome.
    pub fn post_result(
        &self,
        result: impl Into<String>,
        listening: bool,
        listen_since: Option<OffsetDateTime>,
        disconnect: bool,
    ) {
        let mut state = self.lock_state();
        state.result = Some(result.into());
        state.listening = listening;
        state.listen_since = listen_since;
        state.disconnect = disconnect;
        self.result_ready.notify_one();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking holder cannot leave the fields torn: every mutation
        // completes under a single acquisition.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reduces a raw HTTP request block to its decoded request text.
///
/// Keeps the first line only, drops the method token and a trailing
/// ` HTTP/<version>` suffix, then resolves percent-escapes: a typical
/// `GET /status%20now HTTP/1.1` yields `/status now`. The protocol is
/// ASCII, so lossy decoding of the escaped bytes is sufficient.
fn decode_http_request_line(raw: &str) -> String {
    let first_line = raw.split('\n').next().unwrap_or(raw);
    let without_version = match first_line.rfind(" HTTP/") {
        Some(pos) => &first_line[..pos],
        None => first_line,
    };
    let path = match without_version.split_once(' ') {
        Some((_method, path)) => path,
        None => without_version,
    };
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::simple("ping\n", "ping")]
    #[case::carriage_returns("pi\rng\r\n", "ping")]
    #[case::empty_line("\n", "")]
    fn plain_request_terminates_on_trailing_newline(
        #[case] wire: &str,
        #[case] expected: &str,
    ) {
        let message = PendingRequest::new(false);
        assert!(message.add_fragment(wire));
        assert_eq!(message.request_text(), expected);
    }

    #[rstest]
    fn plain_request_accumulates_across_fragments() {
        let message = PendingRequest::new(false);
        assert!(!message.add_fragment("pi"));
        assert!(!message.add_fragment("ng"));
        assert!(message.add_fragment("\n"));
        assert_eq!(message.request_text(), "ping");
    }

    #[rstest]
    fn plain_request_discards_bytes_after_mid_buffer_newline() {
        let message = PendingRequest::new(false);
        assert!(message.add_fragment("first\nsecond"));
        assert_eq!(message.request_text(), "first");
    }

    #[rstest]
    #[case::plain_path("GET /status HTTP/1.1\r\n\r\n", "/status")]
    #[case::percent_escapes("GET /status%20now HTTP/1.1\r\n\r\n", "/status now")]
    #[case::no_version_suffix("GET /status\n\n", "/status")]
    #[case::bare_path("/status HTTP/1.1\r\n\r\n", "/status")]
    fn http_request_keeps_decoded_first_line(#[case] wire: &str, #[case] expected: &str) {
        let message = PendingRequest::new(true);
        assert!(message.add_fragment(wire));
        assert_eq!(message.request_text(), expected);
    }

    #[rstest]
    fn http_request_waits_for_blank_line() {
        let message = PendingRequest::new(true);
        assert!(!message.add_fragment("GET /x HTTP/1.1\r\n"));
        assert!(!message.add_fragment("Host: example\r\n"));
        assert!(message.add_fragment("\r\n"));
        assert_eq!(message.request_text(), "/x");
    }

    #[rstest]
    fn empty_fragment_completes_only_in_listening_mode() {
        let message = PendingRequest::new(false);
        assert!(!message.add_fragment(""));

        message.post_result("subscribed", true, Some(OffsetDateTime::UNIX_EPOCH), false);
        assert_eq!(message.wait_for_result(), "subscribed");
        // Listening heartbeat: an empty accumulator re-queues the request.
        assert!(message.add_fragment(""));
    }

    #[rstest]
    fn partial_data_suppresses_listening_heartbeat() {
        let message = PendingRequest::new(false);
        message.post_result("subscribed", true, None, false);
        let _ = message.wait_for_result();

        assert!(!message.add_fragment("incomple"));
    }

    #[rstest]
    fn wait_consumes_result_and_clears_accumulator() {
        let message = PendingRequest::new(false);
        assert!(message.add_fragment("ping\n"));
        message.post_result("pong", false, None, false);

        assert_eq!(message.wait_for_result(), "pong");
        assert_eq!(message.request_text(), "");
        assert!(!message.is_disconnect());
    }

    #[rstest]
    fn wait_blocks_until_result_is_posted() {
        let message = Arc::new(PendingRequest::new(false));
        let poster = Arc::clone(&message);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            poster.post_result("late", false, None, true);
        });

        assert_eq!(message.wait_for_result(), "late");
        assert!(message.is_disconnect());
        handle.join().expect("join poster");
    }

    #[rstest]
    fn object_is_reusable_across_cycles() {
        let message = PendingRequest::new(false);

        assert!(message.add_fragment("one\n"));
        message.post_result("1", false, None, false);
        assert_eq!(message.wait_for_result(), "1");

        assert!(message.add_fragment("two\n"));
        assert_eq!(message.request_text(), "two");
        message.post_result("2", false, None, false);
        assert_eq!(message.wait_for_result(), "2");
    }

    #[rstest]
    fn post_result_records_listening_window() {
        let message = PendingRequest::new(false);
        let since = OffsetDateTime::UNIX_EPOCH;
        message.post_result("ok", true, Some(since), false);
        let _ = message.wait_for_result();

        assert!(message.is_listening());
        assert_eq!(message.listen_since(), Some(since));
    }
}
