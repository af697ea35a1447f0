//! Transport connection traits and the production TCP implementation.
//!
//! The registry layer never touches sockets directly. It goes through
//! [`TransportConnector`] for dialing and binding, and [`TransportListener`]
//! for accepting, so the same code runs over real TCP ([`TcpNet`]) and over
//! the in-memory network used by tests ([`crate::SimNet`]).
//!
//! Every established connection is reported as a [`Connected`] value carrying
//! the local and remote endpoints alongside the stream itself. The endpoints
//! matter: the duplicate-resolution rank of a channel is computed from its
//! two port numbers, so implementations must report them faithfully.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::types::SocketEndpoint;

/// An established connection plus the endpoints it runs between.
#[derive(Debug)]
pub struct Connected<S> {
    /// The byte stream itself.
    pub stream: S,
    /// Endpoint of the local side of the connection.
    pub local: SocketEndpoint,
    /// Endpoint of the remote side of the connection.
    pub remote: SocketEndpoint,
}

/// Dials and binds connections for one kind of network.
#[async_trait(?Send)]
pub trait TransportConnector: Clone + 'static {
    /// Connection type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// Listener type produced by [`TransportConnector::bind`].
    type Listener: TransportListener<Stream = Self::Stream> + 'static;

    /// Bind a listener on the given endpoint. Port 0 asks for an
    /// implementation-assigned port, discoverable through
    /// [`TransportListener::local_endpoint`].
    async fn bind(&self, endpoint: &SocketEndpoint) -> io::Result<Self::Listener>;

    /// Open a connection to the given endpoint.
    async fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<Connected<Self::Stream>>;
}

/// Accepting side of a bound endpoint.
#[async_trait(?Send)]
pub trait TransportListener {
    /// Connection type produced by [`TransportListener::accept`].
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// The endpoint this listener is actually bound to.
    fn local_endpoint(&self) -> io::Result<SocketEndpoint>;

    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> io::Result<Connected<Self::Stream>>;
}

fn endpoint_of(addr: SocketAddr) -> SocketEndpoint {
    SocketEndpoint::new(addr.ip().to_string(), addr.port())
}

/// Production [`TransportConnector`] backed by tokio TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpNet;

impl TcpNet {
    /// Create a TCP connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl TransportConnector for TcpNet {
    type Stream = TcpStream;
    type Listener = TcpNetListener;

    async fn bind(&self, endpoint: &SocketEndpoint) -> io::Result<TcpNetListener> {
        let listener = TcpListener::bind(endpoint.to_string()).await?;
        Ok(TcpNetListener { listener })
    }

    async fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<Connected<TcpStream>> {
        let stream = TcpStream::connect(endpoint.to_string()).await?;
        stream.set_nodelay(true)?;
        let local = endpoint_of(stream.local_addr()?);
        let remote = endpoint_of(stream.peer_addr()?);
        Ok(Connected {
            stream,
            local,
            remote,
        })
    }
}

/// Listening socket for [`TcpNet`].
#[derive(Debug)]
pub struct TcpNetListener {
    listener: TcpListener,
}

#[async_trait(?Send)]
impl TransportListener for TcpNetListener {
    type Stream = TcpStream;

    fn local_endpoint(&self) -> io::Result<SocketEndpoint> {
        Ok(endpoint_of(self.listener.local_addr()?))
    }

    async fn accept(&mut self) -> io::Result<Connected<TcpStream>> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let local = endpoint_of(stream.local_addr()?);
        Ok(Connected {
            stream,
            local,
            remote: endpoint_of(remote),
        })
    }
}
