//! Transport module - sockets at both ends of the tunnel.
//!
//! Provides:
//! - TCP listener and stream for the tunnel itself
//! - Multicast group membership and the capture loop (client ingress)

mod multicast;
mod tcp;

pub use multicast::{resolve_interface, run_capture, CaptureSource, MulticastReceiver};
pub use tcp::{TunnelListener, TunnelStream};
