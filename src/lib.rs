//! # udp-tunneler
//!
//! Carries UDP multicast traffic across networks that only allow TCP.
//!
//! A client joins a multicast group, captures its datagrams and forwards
//! them over one TCP connection. The server re-emits each datagram over UDP,
//! either to the destination it was originally sent to or to a fixed
//! override address.
//!
//! ## Architecture
//!
//! - **Framing**: `[u16 LE length][packet]` frames on the TCP stream
//! - **Packets**: Heartbeat (`0x01`) or Datagram (`0x02` + length, IPv4
//!   destination, port, raw bytes)
//! - **Client**: capture loop → bounded queue → multiplexer (with periodic
//!   heartbeats) → TCP
//! - **Server**: one dispatcher per connection with a liveness timeout, and
//!   a UDP router shared by all connections
//!
//! ## Example
//!
//! ```ignore
//! use udp_tunneler::{Server, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> udp_tunneler::Result<()> {
//!     let server = Server::bind("0.0.0.0:5055", TunnelConfig::default()).await?;
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod writer;

mod backpressure;
mod client;

pub use backpressure::{datagram_queue, DatagramSender};
pub use client::{Client, ClientBuilder};
pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use server::{CloseReason, Server, UdpRouter};
