//! Frame codec: length-prefixed frames on a byte stream.
//!
//! TCP does not preserve message boundaries, so every packet travels inside
//! a frame whose 2-byte prefix announces its total length. Frames are read
//! and written strictly in order; one stream carries one sequence of frames.
//!
//! # Example
//!
//! ```ignore
//! use udp_tunneler::pool::BufferPool;
//! use udp_tunneler::protocol::{write_frame, FrameCodec, MAX_FRAME_PAYLOAD};
//!
//! let codec = FrameCodec::new(BufferPool::default(), MAX_FRAME_PAYLOAD);
//!
//! let mut wire = Vec::new();
//! write_frame(&mut wire, b"\x01").await.unwrap();
//! assert_eq!(wire, [0x03, 0x00, 0x01]);
//!
//! let payload = codec.read_frame(&mut wire.as_slice()).await.unwrap();
//! assert_eq!(&payload[..], b"\x01");
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::{
    decode_frame_header, encode_frame_header, DATAGRAM_HEADER_LEN, FRAME_HEADER_LEN,
    MAX_FRAME_PAYLOAD,
};
use crate::error::{Result, TunnelError};
use crate::pool::{BufferPool, PooledBuffer};

/// Write one frame carrying `payload`.
///
/// Loops until the whole frame is handed to `writer`. Does not flush; callers
/// with a buffered writer flush after the frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_frame_header(payload.len())?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Frame decoder that reads payloads into pooled buffers.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    pool: BufferPool,
    max_payload: usize,
}

impl FrameCodec {
    /// Create a codec rejecting frames with payloads above `max_payload`.
    pub fn new(pool: BufferPool, max_payload: usize) -> Self {
        Self {
            pool,
            max_payload: max_payload.min(MAX_FRAME_PAYLOAD),
        }
    }

    /// Codec sized for Datagram packets of up to `max_datagram_size` raw bytes.
    pub fn for_datagrams(pool: BufferPool, max_datagram_size: usize) -> Self {
        Self::new(pool, max_datagram_size + DATAGRAM_HEADER_LEN)
    }

    /// Largest accepted frame payload.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Pool that backs decoded payloads.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Read one frame and return its payload.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the stream ends cleanly before a new frame.
    /// - `FrameTooShort` / `FrameTooLarge` for an invalid length prefix.
    /// - `IncompleteFrame` if the stream ends inside a frame.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<PooledBuffer>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let got = read_full(reader, &mut header).await?;
        if got == 0 {
            return Err(TunnelError::ConnectionClosed);
        }
        if got < FRAME_HEADER_LEN {
            return Err(TunnelError::IncompleteFrame {
                expected: FRAME_HEADER_LEN,
                received: got,
            });
        }

        let payload_len = decode_frame_header(header)?;
        if payload_len > self.max_payload {
            return Err(TunnelError::FrameTooLarge {
                length: payload_len,
                max: self.max_payload,
            });
        }

        let mut payload = self.pool.acquire(payload_len);
        let got = read_full(reader, &mut payload).await?;
        if got < payload_len {
            return Err(TunnelError::IncompleteFrame {
                expected: payload_len,
                received: got,
            });
        }

        Ok(payload)
    }
}

/// Read until `buf` is full or the stream ends. Returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::duplex;

    fn codec() -> FrameCodec {
        FrameCodec::new(BufferPool::new(8), MAX_FRAME_PAYLOAD)
    }

    #[tokio::test]
    async fn test_write_frame_layout() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").await.unwrap();
        assert_eq!(wire, [7, 0, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_sizes() {
        let codec = codec();
        for size in [0usize, 1, 9, 109, 4096, MAX_FRAME_PAYLOAD] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut wire = Vec::new();
            write_frame(&mut wire, &payload).await.unwrap();
            assert_eq!(wire.len(), size + FRAME_HEADER_LEN);

            let decoded = codec.read_frame(&mut wire.as_slice()).await.unwrap();
            assert_eq!(&decoded[..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_read_consumes_exactly_one_frame() {
        let codec = codec();
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").await.unwrap();
        write_frame(&mut wire, b"second").await.unwrap();

        let mut cursor = Cursor::new(wire);
        let first = codec.read_frame(&mut cursor).await.unwrap();
        assert_eq!(&first[..], b"first");
        assert_eq!(cursor.position(), 7);

        let second = codec.read_frame(&mut cursor).await.unwrap();
        assert_eq!(&second[..], b"second");
        assert_eq!(cursor.position(), 15);
    }

    #[tokio::test]
    async fn test_write_frame_too_large() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let mut wire = Vec::new();
        let result = write_frame(&mut wire, &payload).await;
        assert!(matches!(result, Err(TunnelError::FrameTooLarge { .. })));
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_read_clean_eof() {
        let codec = codec();
        let result = codec.read_frame(&mut &b""[..]).await;
        assert!(matches!(result, Err(TunnelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_header() {
        let codec = codec();
        let result = codec.read_frame(&mut &[0x05u8][..]).await;
        assert!(matches!(
            result,
            Err(TunnelError::IncompleteFrame {
                expected: 2,
                received: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        let codec = codec();
        // Announces 10 payload bytes, carries 4.
        let wire = [12u8, 0, 1, 2, 3, 4];
        let result = codec.read_frame(&mut &wire[..]).await;
        assert!(matches!(
            result,
            Err(TunnelError::IncompleteFrame {
                expected: 10,
                received: 4
            })
        ));
        // The partially filled buffer went back to the pool.
        assert_eq!(codec.pool().stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_read_length_below_header() {
        let codec = codec();
        let result = codec.read_frame(&mut &[1u8, 0, 0xAA][..]).await;
        assert!(matches!(result, Err(TunnelError::FrameTooShort(1))));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_before_allocating() {
        let codec = FrameCodec::for_datagrams(BufferPool::new(8), 100);
        assert_eq!(codec.max_payload(), 109);

        let wire = encode_frame_header(110).unwrap();
        let result = codec.read_frame(&mut &wire[..]).await;
        assert!(matches!(
            result,
            Err(TunnelError::FrameTooLarge {
                length: 110,
                max: 109
            })
        ));
        assert_eq!(codec.pool().stats().allocated, 0);
    }

    #[tokio::test]
    async fn test_read_across_fragmented_stream() {
        let codec = codec();
        let (mut client, mut server) = duplex(4);

        let writer = tokio::spawn(async move {
            let payload = vec![0xABu8; 300];
            write_frame(&mut client, &payload).await.unwrap();
            client.flush().await.unwrap();
        });

        let decoded = codec.read_frame(&mut server).await.unwrap();
        assert_eq!(decoded.len(), 300);
        assert!(decoded.iter().all(|&b| b == 0xAB));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload_frame() {
        let codec = codec();
        let decoded = codec.read_frame(&mut &[2u8, 0][..]).await.unwrap();
        assert!(decoded.is_empty());
    }
}
