//! Shared configuration for the request gateway daemon.
//!
//! The daemon fronts a single worker with two optional TCP listeners: a plain
//! line-protocol listener and a minimal HTTP listener. This crate owns the
//! declarative knobs for both (ports, interface binding, accept backlog) plus
//! the logging configuration consumed by the daemon's telemetry layer.

mod endpoint;
mod logging;

pub use endpoint::{EndpointError, TcpEndpoint};
pub use logging::{LogFormat, LogFormatParseError};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Default port for the plain line-protocol listener.
pub const DEFAULT_PORT: u16 = 8888;

/// Default accept backlog for both listeners.
pub const DEFAULT_BACKLOG: u16 = 5;

/// Default log filter expression used by the daemon.
pub const DEFAULT_LOG_FILTER: &str = "info";

fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, PartialEq, Eq)]
#[command(name = "reqgated", about = "Request gateway daemon")]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    /// Port for the plain line-protocol listener.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Port for the HTTP listener; 0 disables it.
    #[arg(long, default_value_t = 0)]
    http_port: u16,

    /// Bind the plain listener to the loopback interface only.
    #[arg(long)]
    local_only: bool,

    /// Accept backlog applied to each listener.
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: u16,

    /// Logging output format.
    #[arg(long, default_value_t = LogFormat::default())]
    log_format: LogFormat,

    /// Log filter expression (tracing `EnvFilter` syntax).
    #[arg(long, default_value_t = default_log_filter_string())]
    log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            http_port: 0,
            local_only: false,
            backlog: DEFAULT_BACKLOG,
            log_format: LogFormat::default(),
            log_filter: default_log_filter_string(),
        }
    }
}

impl Config {
    /// Parses configuration from the process command line.
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }

    /// Endpoint for the plain line-protocol listener.
    ///
    /// Binds loopback-only when the `local_only` flag is set, otherwise all
    /// interfaces.
    #[must_use]
    pub fn plain_endpoint(&self) -> TcpEndpoint {
        let host = if self.local_only {
            "127.0.0.1"
        } else {
            "0.0.0.0"
        };
        TcpEndpoint::new(host, self.port)
    }

    /// Endpoint for the HTTP listener, or `None` when it is disabled.
    ///
    /// The HTTP listener always binds to all interfaces.
    #[must_use]
    pub fn http_endpoint(&self) -> Option<TcpEndpoint> {
        (self.http_port > 0).then(|| TcpEndpoint::new("0.0.0.0", self.http_port))
    }

    /// Accept backlog applied to each listener.
    #[must_use]
    pub fn backlog(&self) -> u16 {
        self.backlog
    }

    /// Configured logging output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Configured log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Builds a configuration programmatically; used by embedding code and
    /// tests that bypass the command line.
    #[must_use]
    pub fn with_ports(port: u16, http_port: u16, local_only: bool) -> Self {
        Self {
            port,
            http_port,
            local_only,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn plain_endpoint_honours_local_only_flag() {
        let open = Config::with_ports(8888, 0, false);
        assert_eq!(open.plain_endpoint(), TcpEndpoint::new("0.0.0.0", 8888));

        let local = Config::with_ports(8888, 0, true);
        assert_eq!(local.plain_endpoint(), TcpEndpoint::new("127.0.0.1", 8888));
    }

    #[rstest]
    fn zero_http_port_disables_the_http_listener() {
        let config = Config::with_ports(8888, 0, false);
        assert!(config.http_endpoint().is_none());
    }

    #[rstest]
    fn positive_http_port_binds_all_interfaces() {
        let config = Config::with_ports(8888, 8889, true);
        assert_eq!(
            config.http_endpoint(),
            Some(TcpEndpoint::new("0.0.0.0", 8889))
        );
    }

    #[rstest]
    fn command_line_overrides_defaults() {
        let config = Config::parse_from([
            "reqgated",
            "--port",
            "9000",
            "--http-port",
            "9001",
            "--local-only",
            "--log-format",
            "json",
        ]);
        assert_eq!(config.plain_endpoint(), TcpEndpoint::new("127.0.0.1", 9000));
        assert_eq!(
            config.http_endpoint(),
            Some(TcpEndpoint::new("0.0.0.0", 9001))
        );
        assert_eq!(config.log_format(), LogFormat::Json);
    }
}
