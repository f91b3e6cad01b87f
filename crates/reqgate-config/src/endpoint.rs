use std::fmt;
use std::net::{AddrParseError, Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A TCP bind target for one of the daemon listeners.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TcpEndpoint {
    host: String,
    port: u16,
}

impl TcpEndpoint {
    /// Builds an endpoint from a host string and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host component of the endpoint.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port component of the endpoint.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the endpoint to an IPv4 socket address.
    pub fn socket_addr(&self) -> Result<SocketAddrV4, EndpointError> {
        let ip = Ipv4Addr::from_str(&self.host).map_err(|source| EndpointError::Host {
            host: self.host.clone(),
            source,
        })?;
        Ok(SocketAddrV4::new(ip, self.port))
    }
}

impl fmt::Display for TcpEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "tcp://{}:{}", self.host, self.port)
    }
}

/// Errors encountered while resolving a [`TcpEndpoint`].
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Host component was not a valid IPv4 address.
    #[error("invalid listener host '{host}': {source}")]
    Host {
        /// Configured host string.
        host: String,
        /// Underlying parse error.
        #[source]
        source: AddrParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_tcp_url() {
        let endpoint = TcpEndpoint::new("127.0.0.1", 8888);
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:8888");
    }

    #[test]
    fn resolves_ipv4_socket_addr() {
        let endpoint = TcpEndpoint::new("0.0.0.0", 9000);
        let addr = endpoint.socket_addr().expect("resolve endpoint");
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9000));
    }

    #[test]
    fn rejects_non_ip_host() {
        let endpoint = TcpEndpoint::new("not-an-ip", 9000);
        assert!(endpoint.socket_addr().is_err());
    }
}
