//! Multicast ingress and the capture loop.
//!
//! [`MulticastReceiver`] joins one IPv4 multicast group and yields the
//! datagrams addressed to it. [`run_capture`] moves them into the outbound
//! queue inside pooled buffers, receiving each datagram at offset
//! `DATAGRAM_HEADER_LEN` so the multiplexer can stamp the header in front of
//! it without copying.
//!
//! On Unix the socket is bound to the group address itself, so the kernel
//! only delivers datagrams sent to that group. Elsewhere it binds the
//! wildcard address on the group's port. Address reuse is enabled so other
//! listeners on the host can consume the same group.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;

use crate::backpressure::DatagramSender;
use crate::error::{Result, TunnelError};
use crate::pool::BufferPool;
use crate::protocol::DATAGRAM_HEADER_LEN;
use crate::writer::OutboundDatagram;

/// Source of captured datagrams and the destination each was sent to.
pub trait CaptureSource {
    /// Receive one datagram into `buf`. Returns its length and destination.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<(usize, SocketAddrV4)>> + Send;
}

/// Socket joined to one multicast group. Leaves the group on drop.
#[derive(Debug)]
pub struct MulticastReceiver {
    socket: UdpSocket,
    group: SocketAddrV4,
    interface: Ipv4Addr,
}

impl MulticastReceiver {
    /// Join `group`, optionally on the interface with address `interface`.
    pub async fn join(group: SocketAddrV4, interface: Option<Ipv4Addr>) -> Result<Self> {
        if !group.ip().is_multicast() {
            return Err(TunnelError::Config(format!(
                "{} is not an IPv4 multicast address",
                group.ip()
            )));
        }

        #[cfg(unix)]
        let bind_ip = *group.ip();
        #[cfg(not(unix))]
        let bind_ip = Ipv4Addr::UNSPECIFIED;

        let socket = bind_reusable(SocketAddrV4::new(bind_ip, group.port()))?;
        let interface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(*group.ip(), interface)?;

        tracing::info!(%group, %interface, "Joined multicast group");
        Ok(Self {
            socket,
            group,
            interface,
        })
    }

    /// Joined group.
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Receive one datagram and its sender.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

/// UDP socket bound with `SO_REUSEADDR` (and `SO_REUSEPORT` where available).
fn bind_reusable(addr: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Resolve `--interface` input: an IPv4 address, or an interface name such
/// as `eth0` whose first IPv4 address is used.
pub fn resolve_interface(name_or_addr: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = name_or_addr.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| iface.name == name_or_addr)
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            TunnelError::Config(format!(
                "interface {} not found or has no IPv4 address",
                name_or_addr
            ))
        })
}

impl CaptureSource for MulticastReceiver {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        let (n, source) = self.recv_from(buf).await?;
        tracing::trace!(%source, bytes = n, group = %self.group, "Captured datagram");
        Ok((n, self.group))
    }
}

impl Drop for MulticastReceiver {
    fn drop(&mut self) {
        if let Err(e) = self
            .socket
            .leave_multicast_v4(*self.group.ip(), self.interface)
        {
            tracing::debug!("Leaving multicast group {} failed: {}", self.group, e);
        }
    }
}

/// Capture datagrams from `source` into the outbound queue.
///
/// Each datagram gets a pooled buffer with header head-room and at most
/// `max_datagram_size` payload bytes; longer datagrams are truncated by the
/// socket. Waits while the queue is full. Returns the number of captured
/// datagrams once the queue closes, or the first receive error.
pub async fn run_capture<S>(
    source: &S,
    pool: &BufferPool,
    sender: &DatagramSender,
    max_datagram_size: usize,
) -> Result<u64>
where
    S: CaptureSource,
{
    let mut captured = 0u64;
    loop {
        let mut buffer = pool.acquire(DATAGRAM_HEADER_LEN + max_datagram_size);
        let (n, dest) = source.recv(&mut buffer[DATAGRAM_HEADER_LEN..]).await?;

        let datagram = OutboundDatagram::from_captured(dest, buffer, n)?;
        match sender.send(datagram).await {
            Ok(()) => captured += 1,
            Err(TunnelError::ConnectionClosed) => {
                tracing::debug!(
                    "Outbound queue closed, capture stopped after {} datagrams",
                    captured
                );
                return Ok(captured);
            }
            Err(e) => return Err(e),
        }
    }
}
