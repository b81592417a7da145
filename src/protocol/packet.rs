//! Packet codec: the typed payload carried inside a frame.
//!
//! A packet starts with a one-byte type tag. Heartbeats carry nothing else.
//! Datagrams carry a 9-byte header followed by the raw bytes of one captured
//! UDP datagram.
//!
//! Decoding never copies the datagram bytes: [`Datagram::payload`] borrows
//! the tail of the buffer the packet was decoded from.
//!
//! # Example
//!
//! ```
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use udp_tunneler::protocol::{Datagram, Packet};
//!
//! let dest = SocketAddrV4::new(Ipv4Addr::new(239, 1, 1, 1), 5000);
//! let packet = Packet::Datagram(Datagram::new(dest, b"hello").unwrap());
//!
//! let mut buf = vec![0u8; packet.encoded_len()];
//! packet.encode(&mut buf).unwrap();
//!
//! assert_eq!(Packet::decode(&buf).unwrap(), packet);
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use super::wire_format::{
    DATAGRAM_HEADER_LEN, HEARTBEAT_PACKET_LEN, TYPE_DATAGRAM, TYPE_HEARTBEAT,
};
use crate::error::{Result, TunnelError};

/// Fixed part of a Datagram packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Declared raw datagram length.
    pub length: u16,
    /// Destination the datagram was originally sent to.
    pub dest: SocketAddrV4,
}

impl DatagramHeader {
    /// Create a new header.
    pub fn new(dest: SocketAddrV4, length: u16) -> Self {
        Self { length, dest }
    }

    /// Stamp the 9-byte header into the front of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than `DATAGRAM_HEADER_LEN`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= DATAGRAM_HEADER_LEN);
        buf[0] = TYPE_DATAGRAM;
        buf[1..3].copy_from_slice(&self.length.to_le_bytes());
        buf[3..7].copy_from_slice(&self.dest.ip().octets());
        buf[7..9].copy_from_slice(&self.dest.port().to_le_bytes());
    }

    /// Decode the header from the front of `buf`.
    ///
    /// Returns `None` if the buffer is too short or is not tagged as a datagram.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < DATAGRAM_HEADER_LEN || buf[0] != TYPE_DATAGRAM {
            return None;
        }
        let length = u16::from_le_bytes([buf[1], buf[2]]);
        let ip = Ipv4Addr::new(buf[3], buf[4], buf[5], buf[6]);
        let port = u16::from_le_bytes([buf[7], buf[8]]);
        Some(Self {
            length,
            dest: SocketAddrV4::new(ip, port),
        })
    }
}

/// One tunneled UDP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram<'a> {
    /// Declared length. Must equal `payload.len()` to encode.
    pub length: u16,
    /// Original destination address and port.
    pub dest: SocketAddrV4,
    /// Raw datagram bytes.
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Create a datagram whose declared length matches its payload.
    pub fn new(dest: SocketAddrV4, payload: &'a [u8]) -> Result<Self> {
        let length = u16::try_from(payload.len()).map_err(|_| TunnelError::FrameTooLarge {
            length: payload.len(),
            max: u16::MAX as usize,
        })?;
        Ok(Self {
            length,
            dest,
            payload,
        })
    }

    /// Header fields of this datagram.
    pub fn header(&self) -> DatagramHeader {
        DatagramHeader::new(self.dest, self.length)
    }
}

/// A decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Liveness probe (client → server) or echo (server → client).
    Heartbeat,
    /// Captured datagram.
    Datagram(Datagram<'a>),
}

impl<'a> Packet<'a> {
    /// Decode a packet from a frame payload.
    ///
    /// The datagram payload, if any, borrows from `buf`.
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        let Some(&tag) = buf.first() else {
            return Err(TunnelError::MalformedPacket("empty packet".to_string()));
        };

        match tag {
            TYPE_HEARTBEAT => Ok(Packet::Heartbeat),
            TYPE_DATAGRAM => {
                let header = DatagramHeader::decode(buf).ok_or_else(|| {
                    TunnelError::MalformedPacket(format!(
                        "datagram of {} bytes is shorter than its {} byte header",
                        buf.len(),
                        DATAGRAM_HEADER_LEN
                    ))
                })?;

                let payload = &buf[DATAGRAM_HEADER_LEN..];
                if payload.len() != header.length as usize {
                    return Err(TunnelError::MalformedPacket(format!(
                        "datagram declares {} bytes but carries {}",
                        header.length,
                        payload.len()
                    )));
                }

                Ok(Packet::Datagram(Datagram {
                    length: header.length,
                    dest: header.dest,
                    payload,
                }))
            }
            other => Err(TunnelError::UnknownPacketType(other)),
        }
    }

    /// Encode the packet into the front of `buf`.
    ///
    /// Nothing is written if the datagram length is inconsistent or the
    /// buffer is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if let Packet::Datagram(d) = self {
            if d.payload.len() != d.length as usize {
                return Err(TunnelError::LengthMismatch {
                    declared: d.length,
                    actual: d.payload.len(),
                });
            }
        }

        let required = self.encoded_len();
        if buf.len() < required {
            return Err(TunnelError::BufferTooSmall {
                required,
                available: buf.len(),
            });
        }

        match self {
            Packet::Heartbeat => buf[0] = TYPE_HEARTBEAT,
            Packet::Datagram(d) => {
                d.header().encode_into(buf);
                buf[DATAGRAM_HEADER_LEN..required].copy_from_slice(d.payload);
            }
        }
        Ok(())
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Heartbeat => HEARTBEAT_PACKET_LEN,
            Packet::Datagram(d) => DATAGRAM_HEADER_LEN + d.length as usize,
        }
    }

    /// Packet kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Heartbeat => "heartbeat",
            Packet::Datagram(_) => "datagram",
        }
    }
}
