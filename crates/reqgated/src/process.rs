//! Daemon lifecycle: startup wiring, shutdown signals, and the built-in
//! fallback worker.

use std::io;
use std::thread;

use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{debug, info, warn};

use reqgate_config::Config;

use crate::queue::DispatchQueue;
use crate::server::{Dispatcher, DispatcherError};
use crate::telemetry::{self, TelemetryError};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

/// Abstraction over shutdown notification mechanisms.
pub trait ShutdownSignal {
    /// Blocks until shutdown should proceed.
    fn wait(&self) -> Result<(), ShutdownError>;
}

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Shutdown listener that waits for process termination signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShutdownSignal;

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<(), ShutdownError> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT])
            .map_err(|source| ShutdownError::Install { source })?;
        if let Some(signal) = signals.forever().next() {
            info!(target: PROCESS_TARGET, signal, "shutdown signal received");
        }
        Ok(())
    }
}

/// Errors surfaced while launching or supervising the daemon.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Telemetry could not be initialised.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The dispatcher could not be constructed.
    #[error("failed to start dispatcher: {source}")]
    Dispatcher {
        /// Underlying dispatcher error.
        #[source]
        source: DispatcherError,
    },
    /// The shutdown listener failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Runs the daemon with configuration taken from the command line.
///
/// Requests are served by the built-in echo worker.
pub fn run() -> Result<(), LaunchError> {
    let config = Config::load();
    run_with(&config, SystemShutdownSignal)
}

/// Runs the daemon with injected configuration and shutdown collaborator.
pub fn run_with<S: ShutdownSignal>(config: &Config, shutdown: S) -> Result<(), LaunchError> {
    telemetry::initialise(config).map_err(|source| LaunchError::Telemetry { source })?;

    let (queue, sender) = DispatchQueue::new();
    let dispatcher = Dispatcher::start(config, &queue, sender)
        .map_err(|source| LaunchError::Dispatcher { source })?;
    info!(
        target: PROCESS_TARGET,
        plain = ?dispatcher.plain_addr(),
        http = ?dispatcher.http_addr(),
        "daemon ready"
    );

    let worker_queue = queue.clone();
    let worker = thread::Builder::new()
        .name("echo-worker".to_string())
        .spawn(move || echo_worker(&worker_queue));
    if let Err(ref error) = worker {
        // Without a consumer every connection blocks until shutdown; say so.
        warn!(target: PROCESS_TARGET, error = %error, "failed to start echo worker");
    }

    shutdown.wait()?;
    dispatcher.shutdown();
    if let Ok(handle) = worker {
        let _ = handle.join();
    }
    Ok(())
}

/// Minimal stand-in worker: echoes each request back as its result.
///
/// Runs until the queue disconnects, which [`Dispatcher::shutdown`]
/// guarantees by dropping every producer handle. A real deployment bypasses
/// [`run_with`] and attaches its own consumer to the [`DispatchQueue`] whose
/// sender went to [`Dispatcher::start`].
fn echo_worker(queue: &DispatchQueue) {
    while let Some(message) = queue.next() {
        debug!(
            target: PROCESS_TARGET,
            http = message.is_http(),
            request = ?message.request_text(),
            "echoing request"
        );
        message.post_result(message.request_text(), false, None, false);
    }
    debug!(target: PROCESS_TARGET, "echo worker finished");
}
