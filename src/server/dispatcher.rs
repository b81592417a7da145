//! Per-connection dispatcher.
//!
//! Reads frames from one tunnel client under a liveness deadline, answers
//! heartbeats and hands datagrams to the [`UdpRouter`]. Packet decode errors
//! and routing failures are logged and skipped; anything that breaks the
//! frame stream or the socket closes this connection only.
//!
//! ```text
//! TCP read half ─► BufReader ─► FrameCodec ─► Packet::decode
//!                                                 │
//!                    Heartbeat ◄──────────────────┤
//!                        │                        └─► Datagram ─► UdpRouter
//!                        ▼
//!             BufWriter ─► TCP write half
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use super::router::UdpRouter;
use crate::error::{Result, TunnelError};
use crate::protocol::{write_frame, FrameCodec, Packet, TYPE_HEARTBEAT};
use crate::transport::TunnelStream;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream at a frame boundary.
    Disconnected,
    /// Nothing arrived within the liveness timeout.
    TimedOut,
    /// Frame stream desynchronized or truncated.
    ProtocolError,
    /// Socket read or write failed.
    TransportError,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Disconnected => "disconnected",
            CloseReason::TimedOut => "timed out",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::TransportError => "transport error",
        };
        f.write_str(s)
    }
}

/// Per-connection counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames: u64,
    pub heartbeats: u64,
    pub datagrams: u64,
    /// Packets skipped because they failed to decode.
    pub dropped_packets: u64,
    /// Datagrams the router failed to send.
    pub routing_errors: u64,
}

/// Outcome of a finished connection.
#[derive(Debug)]
pub struct ConnectionSummary {
    pub reason: CloseReason,
    pub stats: ConnectionStats,
    /// Error that closed the connection, if any.
    pub error: Option<TunnelError>,
}

/// Serves one tunnel client until it disconnects, times out or fails.
pub struct Dispatcher<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    peer: SocketAddr,
    codec: FrameCodec,
    router: Arc<UdpRouter>,
    heartbeat_timeout: Duration,
    stats: ConnectionStats,
}

impl Dispatcher<OwnedReadHalf, OwnedWriteHalf> {
    /// Dispatcher for an accepted TCP stream.
    pub fn from_tcp(
        stream: TunnelStream,
        codec: FrameCodec,
        router: Arc<UdpRouter>,
        heartbeat_timeout: Duration,
    ) -> Self {
        let peer = stream.peer_addr();
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer, codec, router, heartbeat_timeout)
    }
}

impl<R, W> Dispatcher<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        peer: SocketAddr,
        codec: FrameCodec,
        router: Arc<UdpRouter>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            peer,
            codec,
            router,
            heartbeat_timeout,
            stats: ConnectionStats::default(),
        }
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Serve frames until the connection closes.
    ///
    /// The streams are dropped on return.
    pub async fn run(mut self) -> ConnectionSummary {
        loop {
            let read = timeout(
                self.heartbeat_timeout,
                self.codec.read_frame(&mut self.reader),
            )
            .await;
            let frame = match read {
                Ok(Ok(frame)) => frame,
                Ok(Err(TunnelError::ConnectionClosed)) => {
                    return self.close(CloseReason::Disconnected, None);
                }
                Ok(Err(e)) if e.is_frame_error() => {
                    return self.close(CloseReason::ProtocolError, Some(e));
                }
                Ok(Err(e)) => return self.close(CloseReason::TransportError, Some(e)),
                Err(_) => {
                    let e = TunnelError::LivenessTimeout(self.heartbeat_timeout);
                    return self.close(CloseReason::TimedOut, Some(e));
                }
            };

            self.stats.frames += 1;
            if let Err(e) = self.handle_frame(&frame).await {
                return self.close(CloseReason::TransportError, Some(e));
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) if e.is_packet_error() => {
                self.stats.dropped_packets += 1;
                tracing::warn!(peer = %self.peer, "Skipping packet: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match packet {
            Packet::Heartbeat => {
                write_frame(&mut self.writer, &[TYPE_HEARTBEAT]).await?;
                self.writer.flush().await?;
                self.stats.heartbeats += 1;
                tracing::trace!(peer = %self.peer, "Heartbeat answered");
            }
            Packet::Datagram(datagram) => {
                self.stats.datagrams += 1;
                match self.router.route(datagram.dest, datagram.payload).await {
                    Ok(()) => {
                        tracing::debug!(
                            peer = %self.peer,
                            dest = %datagram.dest,
                            bytes = datagram.payload.len(),
                            "Datagram forwarded"
                        );
                    }
                    Err(e) => {
                        self.stats.routing_errors += 1;
                        tracing::warn!(peer = %self.peer, "{}", e);
                    }
                }
            }
        }
        Ok(())
    }

    fn close(self, reason: CloseReason, error: Option<TunnelError>) -> ConnectionSummary {
        ConnectionSummary {
            reason,
            stats: self.stats,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::protocol::{Datagram, DEFAULT_MAX_DATAGRAM_SIZE};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::io::{duplex, split, DuplexStream};
    use tokio::net::UdpSocket;
    use tokio::task::JoinHandle;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn codec() -> FrameCodec {
        FrameCodec::for_datagrams(BufferPool::new(8), DEFAULT_MAX_DATAGRAM_SIZE)
    }

    fn spawn(
        router: UdpRouter,
        heartbeat_timeout: Duration,
    ) -> (DuplexStream, JoinHandle<ConnectionSummary>) {
        let (client, server) = duplex(128 * 1024);
        let (reader, writer) = split(server);
        let dispatcher = Dispatcher::new(
            reader,
            writer,
            peer(),
            codec(),
            Arc::new(router),
            heartbeat_timeout,
        );
        (client, tokio::spawn(dispatcher.run()))
    }

    async fn send_packet(stream: &mut DuplexStream, packet: Packet<'_>) {
        let mut buf = vec![0u8; packet.encoded_len()];
        packet.encode(&mut buf).unwrap();
        write_frame(stream, &buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_echoed_once() {
        let (mut client, task) = spawn(UdpRouter::per_destination(), Duration::from_secs(10));

        send_packet(&mut client, Packet::Heartbeat).await;
        let echo = codec().read_frame(&mut client).await.unwrap();
        assert_eq!(Packet::decode(&echo).unwrap(), Packet::Heartbeat);

        drop(client);
        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Disconnected);
        assert_eq!(summary.stats.heartbeats, 1);
        assert_eq!(summary.stats.datagrams, 0);
        assert!(summary.error.is_none());
    }

    #[tokio::test]
    async fn test_datagram_routed_without_response() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(target) = receiver.local_addr().unwrap() else {
            panic!("expected IPv4 address");
        };
        let router = UdpRouter::with_override(target).await.unwrap();
        let (mut client, task) = spawn(router, Duration::from_secs(10));

        let dest = SocketAddrV4::new(Ipv4Addr::new(239, 1, 1, 1), 5000);
        let payload = [0xAB; 100];
        send_packet(&mut client, Packet::Datagram(Datagram::new(dest, &payload).unwrap())).await;

        let mut buf = [0u8; 512];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &payload[..]);

        drop(client);
        let summary = task.await.unwrap();
        assert_eq!(summary.stats.datagrams, 1);
        assert_eq!(summary.stats.frames, 1);
        assert_eq!(summary.stats.routing_errors, 0);
    }

    #[tokio::test]
    async fn test_bad_packets_skipped() {
        let (mut client, task) = spawn(UdpRouter::per_destination(), Duration::from_secs(10));

        // Unknown type, then a datagram whose declared length is wrong.
        write_frame(&mut client, &[0x07, 0xFF]).await.unwrap();
        write_frame(&mut client, &[0x02, 0x05, 0x00, 239, 1, 1, 1, 0x88, 0x13, 1, 2])
            .await
            .unwrap();
        send_packet(&mut client, Packet::Heartbeat).await;

        let echo = codec().read_frame(&mut client).await.unwrap();
        assert_eq!(Packet::decode(&echo).unwrap(), Packet::Heartbeat);

        drop(client);
        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Disconnected);
        assert_eq!(summary.stats.frames, 3);
        assert_eq!(summary.stats.dropped_packets, 2);
    }

    #[tokio::test]
    async fn test_truncated_frame_closes_connection() {
        let (mut client, task) = spawn(UdpRouter::per_destination(), Duration::from_secs(10));

        client.write_all(&[0x0A, 0x00, 0x02, 0x01]).await.unwrap();
        drop(client);

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::ProtocolError);
        assert!(matches!(
            summary.error,
            Some(TunnelError::IncompleteFrame { expected: 8, received: 2 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (client, server) = duplex(1024);
        let (reader, writer) = split(server);
        let small = FrameCodec::for_datagrams(BufferPool::new(1), 16);
        let dispatcher = Dispatcher::new(
            reader,
            writer,
            peer(),
            small,
            Arc::new(UdpRouter::per_destination()),
            Duration::from_secs(10),
        );
        let task = tokio::spawn(dispatcher.run());

        let mut client = client;
        client.write_all(&[0xFF, 0x00]).await.unwrap();

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::ProtocolError);
        assert!(matches!(
            summary.error,
            Some(TunnelError::FrameTooLarge { length: 253, max: 25 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_times_out() {
        let (_client, task) = spawn(UdpRouter::per_destination(), Duration::from_secs(10));

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::TimedOut);
        assert!(matches!(
            summary.error,
            Some(TunnelError::LivenessTimeout(t)) if t == Duration::from_secs(10)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_connection_alive() {
        let (mut client, task) = spawn(UdpRouter::per_destination(), Duration::from_secs(10));

        // Four heartbeats at half the timeout span twice the timeout.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            send_packet(&mut client, Packet::Heartbeat).await;
            let echo = codec().read_frame(&mut client).await.unwrap();
            assert_eq!(Packet::decode(&echo).unwrap(), Packet::Heartbeat);
        }
        assert!(!task.is_finished());

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::TimedOut);
        assert_eq!(summary.stats.heartbeats, 4);
    }
}
