//! Tunnel server: accepts clients and re-emits their datagrams over UDP.
//!
//! One task per connection runs a [`Dispatcher`]. All of them share a single
//! [`UdpRouter`], so a destination opened by one client is reused by the
//! others.
//!
//! # Example
//!
//! ```ignore
//! use udp_tunneler::{Server, TunnelConfig};
//!
//! let server = Server::bind("0.0.0.0:5055", TunnelConfig::default()).await?;
//! server.run().await?;
//! ```

mod dispatcher;
mod router;

pub use dispatcher::{CloseReason, ConnectionStats, ConnectionSummary, Dispatcher};
pub use router::UdpRouter;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::ToSocketAddrs;

use crate::config::TunnelConfig;
use crate::error::Result;
use crate::pool::BufferPool;
use crate::protocol::FrameCodec;
use crate::transport::{TunnelListener, TunnelStream};

/// Bound tunnel server.
#[derive(Debug)]
pub struct Server {
    listener: TunnelListener,
    router: Arc<UdpRouter>,
    codec: FrameCodec,
    config: TunnelConfig,
}

impl Server {
    /// Validate `config`, open the egress router and bind the listener.
    pub async fn bind(addr: impl ToSocketAddrs, config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let router = Arc::new(UdpRouter::from_config(&config).await?);
        let listener = TunnelListener::bind(addr).await?;
        let pool = BufferPool::new(config.max_idle_buffers);
        let codec = FrameCodec::for_datagrams(pool, config.max_datagram_size);

        tracing::info!(
            addr = %listener.local_addr()?,
            heartbeat_timeout = ?config.heartbeat_timeout,
            "Tunnel server listening"
        );
        Ok(Self {
            listener,
            router,
            codec,
            config,
        })
    }

    /// Listening address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared egress router.
    pub fn router(&self) -> &Arc<UdpRouter> {
        &self.router
    }

    /// Accept clients until the task is cancelled.
    ///
    /// Accept failures are logged and do not stop the server.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok(stream) => self.spawn_connection(stream),
                Err(e) => tracing::warn!("Accept failed: {}", e),
            }
        }
    }

    fn spawn_connection(&self, stream: TunnelStream) {
        let peer = stream.peer_addr();
        tracing::info!(%peer, "Client connected");

        let dispatcher = Dispatcher::from_tcp(
            stream,
            self.codec.clone(),
            Arc::clone(&self.router),
            self.config.heartbeat_timeout,
        );

        tokio::spawn(async move {
            let summary = dispatcher.run().await;
            let stats = summary.stats;
            match (summary.reason, summary.error) {
                (CloseReason::Disconnected, _) | (CloseReason::TimedOut, None) => {
                    tracing::info!(
                        %peer,
                        reason = %summary.reason,
                        datagrams = stats.datagrams,
                        heartbeats = stats.heartbeats,
                        "Client disconnected"
                    );
                }
                (CloseReason::TimedOut, Some(e)) => {
                    tracing::info!(%peer, datagrams = stats.datagrams, "Client dropped: {}", e);
                }
                (reason, error) => {
                    let error = error.map(|e| e.to_string()).unwrap_or_default();
                    tracing::error!(
                        %peer,
                        %reason,
                        datagrams = stats.datagrams,
                        "Connection closed: {}",
                        error
                    );
                }
            }
        });
    }
}
