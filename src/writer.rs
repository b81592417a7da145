//! Outbound multiplexer: the single writer of the client's TCP stream.
//!
//! Two sources feed one ordered stream of frames:
//!
//! ```text
//! heartbeat timer (timeout / 2) ─┐
//!                                ├─► Multiplexer Task ─► BufWriter ─► TCP
//! capture ─► DatagramSender ─────┘
//! ```
//!
//! Whichever source is ready first is written next; there is no priority.
//! Captured datagrams arrive in pooled buffers that already reserve room for
//! the 9-byte Datagram header, so the header is stamped in place and the
//! payload is never copied. The buffer is released as soon as its frame has
//! been written, whether the write succeeded or not.
//!
//! Any write or flush error ends the task with that error; the connection is
//! then torn down by the owner. There is no retry.

use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{Result, TunnelError};
use crate::pool::{BufferPool, PooledBuffer};
use crate::protocol::{
    write_frame, DatagramHeader, Packet, DATAGRAM_HEADER_LEN, HEARTBEAT_PACKET_LEN,
};

/// A captured datagram waiting to be framed.
///
/// Owns its pooled buffer: bytes `[0..9)` are head-room for the header and
/// bytes `[9..9 + len)` hold the raw datagram.
#[derive(Debug)]
pub struct OutboundDatagram {
    header: DatagramHeader,
    buffer: PooledBuffer,
}

impl OutboundDatagram {
    /// Wrap a buffer whose payload was received at offset `DATAGRAM_HEADER_LEN`.
    ///
    /// The buffer is shortened to the header plus `len` payload bytes.
    pub fn from_captured(dest: SocketAddrV4, mut buffer: PooledBuffer, len: usize) -> Result<Self> {
        let available = buffer.len().saturating_sub(DATAGRAM_HEADER_LEN);
        if len > available {
            return Err(TunnelError::BufferTooSmall {
                required: DATAGRAM_HEADER_LEN + len,
                available: buffer.len(),
            });
        }
        let length = u16::try_from(len).map_err(|_| TunnelError::FrameTooLarge {
            length: len,
            max: u16::MAX as usize,
        })?;

        buffer.truncate(DATAGRAM_HEADER_LEN + len);
        Ok(Self {
            header: DatagramHeader::new(dest, length),
            buffer,
        })
    }

    /// Copy `payload` into a fresh pooled buffer.
    pub fn copy_from(pool: &BufferPool, dest: SocketAddrV4, payload: &[u8]) -> Result<Self> {
        let mut buffer = pool.acquire(DATAGRAM_HEADER_LEN + payload.len());
        buffer[DATAGRAM_HEADER_LEN..].copy_from_slice(payload);
        Self::from_captured(dest, buffer, payload.len())
    }

    /// Original destination.
    pub fn dest(&self) -> SocketAddrV4 {
        self.header.dest
    }

    /// Raw datagram bytes.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[DATAGRAM_HEADER_LEN..]
    }

    /// Stamp the header into the head-room and return the encoded packet.
    pub fn into_packet_buffer(mut self) -> PooledBuffer {
        self.header.encode_into(&mut self.buffer);
        self.buffer
    }
}

/// Counters reported when the multiplexer stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Heartbeat frames written.
    pub heartbeats: u64,
    /// Datagram frames written.
    pub datagrams: u64,
}

/// Spawn the multiplexer task on the write half of the server connection.
pub fn spawn_multiplexer<W>(
    writer: W,
    rx: mpsc::Receiver<OutboundDatagram>,
    heartbeat_interval: Duration,
) -> JoinHandle<Result<MultiplexerStats>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(run_multiplexer(writer, rx, heartbeat_interval))
}

/// Multiplexer loop. Returns when every sender is gone or on the first
/// write error.
///
/// The first heartbeat goes out one interval after start.
pub async fn run_multiplexer<W>(
    writer: W,
    mut rx: mpsc::Receiver<OutboundDatagram>,
    heartbeat_interval: Duration,
) -> Result<MultiplexerStats>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let mut stats = MultiplexerStats::default();

    let mut heartbeat = [0u8; HEARTBEAT_PACKET_LEN];
    Packet::Heartbeat.encode(&mut heartbeat)?;

    let mut ticker = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                write_and_flush(&mut writer, &heartbeat).await?;
                stats.heartbeats += 1;
                tracing::trace!("Heartbeat sent");
            }
            next = rx.recv() => {
                let Some(datagram) = next else {
                    tracing::debug!(
                        "Outbound queue closed after {} datagrams, {} heartbeats",
                        stats.datagrams,
                        stats.heartbeats
                    );
                    writer.shutdown().await?;
                    return Ok(stats);
                };

                let dest = datagram.dest();
                let frame = datagram.into_packet_buffer();
                let result = write_and_flush(&mut writer, &frame).await;
                let len = frame.len();
                frame.release();
                result?;

                stats.datagrams += 1;
                tracing::trace!(%dest, bytes = len - DATAGRAM_HEADER_LEN, "Datagram sent");
            }
        }
    }
}

async fn write_and_flush<W>(writer: &mut BufWriter<W>, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, payload).await?;
    writer.flush().await?;
    Ok(())
}
