//! Protocol module - wire format, framing, and packet types.
//!
//! This module implements the tunnel's binary protocol:
//! - 2-byte little-endian frame length prefix
//! - Frame codec reading payloads into pooled buffers
//! - Heartbeat and Datagram packet encoding/decoding

mod frame;
mod packet;
mod wire_format;

pub use frame::{write_frame, FrameCodec};
pub use packet::{Datagram, DatagramHeader, Packet};
pub use wire_format::{
    decode_frame_header, encode_frame_header, DATAGRAM_HEADER_LEN, DEFAULT_MAX_DATAGRAM_SIZE,
    FRAME_HEADER_LEN, HEARTBEAT_PACKET_LEN, MAX_DATAGRAM_PAYLOAD, MAX_FRAME_PAYLOAD,
    TYPE_DATAGRAM, TYPE_HEARTBEAT,
};
