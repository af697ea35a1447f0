//! Core identity types shared by the hawser crates.
//!
//! A node is known to its peers by a *stable address*: the `host:port` its
//! stream listener lives on. Sockets come and go, the stable address does
//! not, and everything above the socket layer keys its state by [`NodeId`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `host:port` pair.
///
/// The host is kept as a string so that simulated networks can use plain
/// names ("client", "server") instead of IP addresses. Ordering is
/// lexicographic on `(host, port)`, which gives both ends of a connection a
/// common way to order the two endpoints of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketEndpoint {
    /// Host name or IP address.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl SocketEndpoint {
    /// Create an endpoint from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an endpoint from `host:port` form.
    pub fn parse(input: &str) -> Result<Self, EndpointParseError> {
        let (host, port) = input
            .rsplit_once(':')
            .ok_or(EndpointParseError::MissingPort)?;
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }
        let port = port
            .parse()
            .map_err(|_| EndpointParseError::InvalidPort(port.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for SocketEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

/// Errors from parsing a [`SocketEndpoint`] out of a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    /// The input had no `:port` suffix.
    #[error("endpoint is missing a ':port' suffix")]
    MissingPort,
    /// The input had nothing before the `:port` suffix.
    #[error("endpoint has an empty host")]
    EmptyHost,
    /// The port was not a number in `0..=65535`.
    #[error("invalid port number: {0}")]
    InvalidPort(String),
}

/// Stable identity of a node: the endpoint its stream listener is bound to.
///
/// Remote socket addresses of accepted connections are ephemeral and never
/// identify a node; the [`NodeId`] a peer announces in its handshake is what
/// all registry state is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(SocketEndpoint);

impl NodeId {
    /// Create an identity from its stream listener endpoint.
    pub fn new(endpoint: SocketEndpoint) -> Self {
        Self(endpoint)
    }

    /// Parse an identity from `host:port` form.
    pub fn parse(input: &str) -> Result<Self, EndpointParseError> {
        Ok(Self(SocketEndpoint::parse(input)?))
    }

    /// The stream listener endpoint this identity stands for.
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The two transports a channel can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Reliable ordered byte stream on the node's well-known port.
    Stream,
    /// Bulk transport on a per-process port discovered via handshake.
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Datagram => write!(f, "datagram"),
        }
    }
}
