//! Endpoint abstraction for bind/connect addressing.
//!
//! Accepts the address forms an embedded stack is usually configured with:
//! an optional `tcp://` or `udp://` scheme, then `host:port`, `:port` or a
//! bare `port`. Hosts are either literal IPs or names that still need
//! resolving.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Transport selected by the endpoint scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Host part of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// Literal IPv4 or IPv6 address
    Ip(IpAddr),
    /// Name that must be resolved first
    Name(String),
}

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: Transport,
    pub host: Host,
    pub port: u16,
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:1883`
    /// - `udp://[::1]:53` (IPv6)
    /// - `tcp://broker.local:1883` (needs resolving)
    /// - `127.0.0.1:8000` (TCP implied)
    /// - `:8000` or `8000` (all IPv4 interfaces)
    ///
    /// # Examples
    ///
    /// ```
    /// use keel_core::endpoint::{Endpoint, Transport};
    ///
    /// let endpoint = Endpoint::parse("udp://8.8.8.8:53").unwrap();
    /// assert_eq!(endpoint.transport, Transport::Udp);
    /// assert!(endpoint.socket_addr().is_some());
    ///
    /// let endpoint = Endpoint::parse("tcp://example.org:80").unwrap();
    /// assert!(endpoint.socket_addr().is_none());
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    #[must_use]
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Tcp,
            host: Host::Ip(addr.ip()),
            port: addr.port(),
        }
    }

    #[must_use]
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Udp,
            ..Self::tcp(addr)
        }
    }

    /// Returns true if this is a TCP endpoint.
    pub fn is_tcp(&self) -> bool {
        self.transport == Transport::Tcp
    }

    /// Returns true if this is a UDP endpoint.
    pub fn is_udp(&self) -> bool {
        self.transport == Transport::Udp
    }

    /// The socket address, if the host is a literal IP.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::Ip(ip) => Some(SocketAddr::new(*ip, self.port)),
            Host::Name(_) => None,
        }
    }

    /// The host name, if the host is not a literal IP.
    #[must_use]
    pub fn host_name(&self) -> Option<&str> {
        match &self.host {
            Host::Name(name) => Some(name),
            Host::Ip(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, rest) = if let Some(rest) = s.strip_prefix("tcp://") {
            (Transport::Tcp, rest)
        } else if let Some(rest) = s.strip_prefix("udp://") {
            (Transport::Udp, rest)
        } else if let Some((scheme, _)) = s.split_once("://") {
            return Err(EndpointError::InvalidScheme(scheme.to_string()));
        } else {
            (Transport::Tcp, s)
        };

        if rest.is_empty() {
            return Err(EndpointError::MissingPort(s.to_string()));
        }

        // bare port
        if let Ok(port) = rest.parse::<u16>() {
            return Ok(Self {
                transport,
                host: Host::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                port,
            });
        }

        if let Ok(addr) = rest.parse::<SocketAddr>() {
            return Ok(Self {
                transport,
                host: Host::Ip(addr.ip()),
                port: addr.port(),
            });
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;

        let host = if host.is_empty() {
            Host::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        } else if let Ok(ip) = host.parse::<IpAddr>() {
            Host::Ip(ip)
        } else if is_valid_host_name(host) {
            Host::Name(host.to_string())
        } else {
            return Err(EndpointError::InvalidHost(host.to_string()));
        };

        Ok(Self { transport, host, port })
    }
}

fn is_valid_host_name(host: &str) -> bool {
    host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "{}://[{}]:{}", self.transport, ip, self.port),
            Host::Ip(ip) => write!(f, "{}://{}:{}", self.transport, ip, self.port),
            Host::Name(name) => write!(f, "{}://{}:{}", self.transport, name, self.port),
        }
    }
}

/// Errors that can occur when parsing endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp:// or udp://)")]
    InvalidScheme(String),

    #[error("Missing port in endpoint: {0}")]
    MissingPort(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),
}
