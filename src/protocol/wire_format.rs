//! Wire format constants and the frame length prefix.
//!
//! ```text
//! Frame:
//! ┌──────────────┬──────────────────────────────┐
//! │ total_length │ payload (encoded Packet)     │
//! │ u16 LE       │ total_length - 2 bytes       │
//! └──────────────┴──────────────────────────────┘
//!
//! Packet (Heartbeat):
//! ┌──────┐
//! │ 0x01 │
//! └──────┘
//!
//! Packet (Datagram):
//! ┌──────┬──────────┬────────────┬──────────┬─────────────────┐
//! │ 0x02 │ length   │ IPv4 addr  │ port     │ raw datagram    │
//! │ u8   │ u16 LE   │ 4 octets   │ u16 LE   │ length bytes    │
//! └──────┴──────────┴────────────┴──────────┴─────────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. The IPv4 address is stored as
//! its four octets in network order.

use crate::error::{Result, TunnelError};

/// Frame length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a frame can carry (the prefix counts itself).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize - FRAME_HEADER_LEN;

/// Packet type tag for heartbeats.
pub const TYPE_HEARTBEAT: u8 = 0x01;

/// Packet type tag for tunneled datagrams.
pub const TYPE_DATAGRAM: u8 = 0x02;

/// Encoded heartbeat size (tag only).
pub const HEARTBEAT_PACKET_LEN: usize = 1;

/// Datagram header size: tag + length + address + port.
pub const DATAGRAM_HEADER_LEN: usize = 1 + 2 + 4 + 2;

/// Largest raw datagram a Datagram packet can carry inside one frame.
pub const MAX_DATAGRAM_PAYLOAD: usize = MAX_FRAME_PAYLOAD - DATAGRAM_HEADER_LEN;

/// Default maximum captured datagram size (largest IPv4 UDP payload).
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_507;

/// Encode the length prefix for a frame carrying `payload_len` bytes.
///
/// Fails with `FrameTooLarge` if the total does not fit in a u16.
pub fn encode_frame_header(payload_len: usize) -> Result<[u8; FRAME_HEADER_LEN]> {
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(TunnelError::FrameTooLarge {
            length: payload_len,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let total = (payload_len + FRAME_HEADER_LEN) as u16;
    Ok(total.to_le_bytes())
}

/// Decode a length prefix into the payload length it announces.
///
/// Fails with `FrameTooShort` if `total_length < 2`.
pub fn decode_frame_header(bytes: [u8; FRAME_HEADER_LEN]) -> Result<usize> {
    let total = u16::from_le_bytes(bytes);
    if (total as usize) < FRAME_HEADER_LEN {
        return Err(TunnelError::FrameTooShort(total));
    }
    Ok(total as usize - FRAME_HEADER_LEN)
}
