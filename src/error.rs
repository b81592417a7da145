//! Error types for udp-tunneler.

use std::net::SocketAddrV4;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// I/O error on a TCP or UDP socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading a configuration file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Frame length prefix smaller than the length prefix itself.
    #[error("Frame length {0} is shorter than the frame header")]
    FrameTooShort(u16),

    /// Frame payload larger than the configured or encodable maximum.
    #[error("Frame payload of {length} bytes exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// Stream ended in the middle of a frame.
    #[error("Incomplete frame: expected {expected} bytes, got {received}")]
    IncompleteFrame { expected: usize, received: usize },

    /// Packet type tag not recognised.
    #[error("Unknown packet type [{0}]")]
    UnknownPacketType(u8),

    /// Packet header fields inconsistent with the packet bytes.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Datagram raw-bytes length differs from its declared length.
    #[error("Invalid datagram length [{actual}], expected [{declared}]")]
    LengthMismatch { declared: u16, actual: usize },

    /// Destination buffer cannot hold the encoded packet.
    #[error("Buffer of {available} bytes too small for {required} byte packet")]
    BufferTooSmall { required: usize, available: usize },

    /// UDP egress failure for one destination.
    #[error("Routing to {dest} failed: {source}")]
    Routing {
        dest: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    /// No frame received within the liveness timeout.
    #[error("No frame received for {0:?}")]
    LivenessTimeout(Duration),

    /// Peer sent a packet that is not valid in this direction.
    #[error("Unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    /// Outbound queue at capacity.
    #[error("Outbound queue full")]
    QueueFull,

    /// Connection closed by the peer or the local side.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl TunnelError {
    /// Framing errors desynchronize the stream and end the connection.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            TunnelError::FrameTooShort(_)
                | TunnelError::FrameTooLarge { .. }
                | TunnelError::IncompleteFrame { .. }
        )
    }

    /// Packet decode errors leave the frame boundary intact.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            TunnelError::UnknownPacketType(_) | TunnelError::MalformedPacket(_)
        )
    }
}

/// Result type alias using TunnelError.
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TunnelError::FrameTooShort(1).is_frame_error());
        assert!(TunnelError::IncompleteFrame {
            expected: 10,
            received: 3
        }
        .is_frame_error());
        assert!(!TunnelError::FrameTooShort(1).is_packet_error());

        assert!(TunnelError::UnknownPacketType(7).is_packet_error());
        assert!(TunnelError::MalformedPacket("short".into()).is_packet_error());
        assert!(!TunnelError::ConnectionClosed.is_packet_error());
        assert!(!TunnelError::ConnectionClosed.is_frame_error());
    }

    #[test]
    fn test_error_messages() {
        let err = TunnelError::LengthMismatch {
            declared: 100,
            actual: 99,
        };
        assert_eq!(err.to_string(), "Invalid datagram length [99], expected [100]");

        let err = TunnelError::UnknownPacketType(0x07);
        assert_eq!(err.to_string(), "Unknown packet type [7]");
    }
}
