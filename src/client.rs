//! Tunnel client: connection lifecycle.
//!
//! The [`ClientBuilder`] takes the configuration and connects. The
//! [`Client`] then runs two tasks on the split TCP stream:
//! 1. the multiplexer, writing heartbeats and queued datagrams
//! 2. the read loop, expecting heartbeat echoes only
//!
//! Datagrams enter through a [`DatagramSender`], usually held by the
//! multicast capture loop. The client never reconnects; once either task
//! ends the connection is over and [`Client::wait_for_shutdown`] reports why.
//!
//! # Example
//!
//! ```ignore
//! use udp_tunneler::transport::{run_capture, MulticastReceiver};
//! use udp_tunneler::{Client, TunnelConfig};
//!
//! let config = TunnelConfig::default();
//! let client = Client::builder().config(config.clone()).connect("10.0.0.1:5055").await?;
//! let receiver = MulticastReceiver::join("239.1.1.1:5000".parse()?, None).await?;
//!
//! let sender = client.sender();
//! let pool = client.pool().clone();
//! tokio::spawn(async move {
//!     run_capture(&receiver, &pool, &sender, config.max_datagram_size).await
//! });
//!
//! client.wait_for_shutdown().await?;
//! ```

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, BufReader};
use tokio::net::ToSocketAddrs;
use tokio::task::{JoinError, JoinHandle};

use crate::backpressure::{datagram_queue, DatagramSender};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::pool::BufferPool;
use crate::protocol::{FrameCodec, Packet};
use crate::transport::TunnelStream;
use crate::writer::{spawn_multiplexer, MultiplexerStats, OutboundDatagram};

/// Builder for configuring and connecting a tunnel client.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: TunnelConfig,
    pool: Option<BufferPool>,
}

impl ClientBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing buffer pool instead of creating one.
    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Connect to the server at `addr` and start the client tasks.
    pub async fn connect(self, addr: impl ToSocketAddrs) -> Result<Client> {
        self.config.validate()?;
        let pool = self
            .pool
            .unwrap_or_else(|| BufferPool::new(self.config.max_idle_buffers));
        let stream = TunnelStream::connect(addr).await?;
        Client::start(stream, self.config, pool)
    }
}

/// A connected tunnel client.
///
/// Dropping the client and every [`DatagramSender`] closes the connection
/// gracefully.
#[derive(Debug)]
pub struct Client {
    sender: DatagramSender,
    pool: BufferPool,
    peer: SocketAddr,
    local: SocketAddr,
    heartbeats_received: Arc<AtomicU64>,
    writer_task: JoinHandle<Result<MultiplexerStats>>,
    reader_task: JoinHandle<Result<()>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with `config`.
    pub async fn connect(addr: impl ToSocketAddrs, config: TunnelConfig) -> Result<Self> {
        ClientBuilder::new().config(config).connect(addr).await
    }

    fn start(stream: TunnelStream, config: TunnelConfig, pool: BufferPool) -> Result<Self> {
        let peer = stream.peer_addr();
        let local = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (sender, rx) = datagram_queue(config.queue_capacity);
        let writer_task = spawn_multiplexer(write_half, rx, config.heartbeat_interval());

        let heartbeats_received = Arc::new(AtomicU64::new(0));
        let codec = FrameCodec::for_datagrams(pool.clone(), config.max_datagram_size);
        let reader_task = tokio::spawn(read_loop(
            read_half,
            codec,
            Arc::clone(&heartbeats_received),
        ));

        tracing::info!(server = %peer, %local, "Connected to tunnel server");
        Ok(Self {
            sender,
            pool,
            peer,
            local,
            heartbeats_received,
            writer_task,
            reader_task,
        })
    }

    /// Handle for enqueueing datagrams.
    pub fn sender(&self) -> DatagramSender {
        self.sender.clone()
    }

    /// Pool that capture buffers should come from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Server address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the tunnel connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Heartbeat echoes received so far.
    pub fn heartbeats_received(&self) -> u64 {
        self.heartbeats_received.load(Ordering::Relaxed)
    }

    /// Copy `payload` into a pooled buffer and queue it for `dest`.
    pub async fn send_datagram(&self, dest: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let datagram = OutboundDatagram::copy_from(&self.pool, dest, payload)?;
        self.sender.send(datagram).await
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.sender.is_backpressure_active()
    }

    /// Get the current queued datagram count.
    pub fn pending_datagrams(&self) -> usize {
        self.sender.pending_count()
    }

    /// Wait until the connection ends.
    ///
    /// Drops this client's own sender first. Returns the multiplexer's
    /// counters when the connection closed because every sender was dropped,
    /// or the error that ended it.
    pub async fn wait_for_shutdown(self) -> Result<MultiplexerStats> {
        let Client {
            sender,
            mut writer_task,
            mut reader_task,
            ..
        } = self;
        drop(sender);

        tokio::select! {
            res = &mut writer_task => {
                reader_task.abort();
                let stats = joined(res)?;
                tracing::info!(
                    datagrams = stats.datagrams,
                    heartbeats = stats.heartbeats,
                    "Tunnel connection closed"
                );
                Ok(stats)
            }
            res = &mut reader_task => {
                writer_task.abort();
                joined(res)?;
                Err(TunnelError::ConnectionClosed)
            }
        }
    }
}

fn joined<T>(res: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    res.map_err(|e| TunnelError::Io(io::Error::other(e)))?
}

/// Read loop: counts heartbeat echoes, fails on anything else.
async fn read_loop<R>(reader: R, codec: FrameCodec, heartbeats: Arc<AtomicU64>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let frame = codec.read_frame(&mut reader).await?;
        match Packet::decode(&frame)? {
            Packet::Heartbeat => {
                let n = heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!("Heartbeat echo received ({})", n);
            }
            other => {
                tracing::error!("Server sent a {} packet", other.kind());
                return Err(TunnelError::UnexpectedPacket(other.kind()));
            }
        }
    }
}
