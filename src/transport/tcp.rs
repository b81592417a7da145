//! TCP stream between tunnel client and server.
//!
//! Thin wrappers over tokio's TCP types that apply the tunnel's socket
//! options (`TCP_NODELAY`, since every frame is flushed on its own) and keep
//! the peer address at hand for logging.
//!
//! # Example
//!
//! ```ignore
//! use udp_tunneler::transport::{TunnelListener, TunnelStream};
//!
//! let listener = TunnelListener::bind("127.0.0.1:5055").await?;
//! let client = TunnelStream::connect("127.0.0.1:5055").await?;
//! let server_side = listener.accept().await?;
//! ```

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::Result;

/// Listening socket for incoming tunnel clients.
#[derive(Debug)]
pub struct TunnelListener {
    listener: TcpListener,
}

impl TunnelListener {
    /// Bind to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept one client connection.
    pub async fn accept(&self) -> Result<TunnelStream> {
        let (stream, peer) = self.listener.accept().await?;
        TunnelStream::from_parts(stream, peer)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Connected tunnel stream.
#[derive(Debug)]
pub struct TunnelStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TunnelStream {
    /// Connect to a tunnel server.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        Self::from_parts(stream, peer)
    }

    fn from_parts(stream: TcpStream, peer: SocketAddr) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Split into independently owned read and write halves.
    ///
    /// Dropping both halves closes the socket.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
