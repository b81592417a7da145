//! UDP egress: re-emits tunneled datagrams.
//!
//! Two modes, fixed at startup:
//!
//! - **Override**: one socket connected to a configured address receives
//!   every datagram, whatever its declared destination.
//! - **Per destination**: a registry holds one connected socket per
//!   destination, opened lazily on first use and kept for the life of the
//!   process.
//!
//! The registry is shared by every connection. Its lock only covers the
//! lookup and the insert, never a socket operation.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};

enum Mode {
    Override {
        target: SocketAddrV4,
        socket: UdpSocket,
    },
    PerDestination(Mutex<HashMap<SocketAddrV4, Arc<UdpSocket>>>),
}

/// Sends datagrams to their destination or to the override address.
pub struct UdpRouter {
    mode: Mode,
}

impl UdpRouter {
    /// Router that opens one socket per destination.
    pub fn per_destination() -> Self {
        Self {
            mode: Mode::PerDestination(Mutex::new(HashMap::new())),
        }
    }

    /// Router that sends everything to `target`.
    ///
    /// The socket is opened now; failure is a startup error.
    pub async fn with_override(target: SocketAddrV4) -> Result<Self> {
        let socket = open_socket(target)
            .await
            .map_err(|source| TunnelError::Routing {
                dest: target,
                source,
            })?;
        tracing::info!(%target, "Forwarding all datagrams to override address");
        Ok(Self {
            mode: Mode::Override { target, socket },
        })
    }

    /// Build the router described by `config`.
    pub async fn from_config(config: &TunnelConfig) -> Result<Self> {
        match config.udp_override {
            Some(target) => Self::with_override(target).await,
            None => Ok(Self::per_destination()),
        }
    }

    /// Override address, if any.
    pub fn override_target(&self) -> Option<SocketAddrV4> {
        match &self.mode {
            Mode::Override { target, .. } => Some(*target),
            Mode::PerDestination(_) => None,
        }
    }

    /// Number of per-destination sockets opened so far.
    pub fn open_sockets(&self) -> usize {
        match &self.mode {
            Mode::Override { .. } => 1,
            Mode::PerDestination(registry) => lock(registry).len(),
        }
    }

    /// Send `payload` as one datagram for `dest`.
    pub async fn route(&self, dest: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let result = match &self.mode {
            Mode::Override { socket, .. } => send_all(socket, payload).await,
            Mode::PerDestination(registry) => match self.socket_for(registry, dest).await {
                Ok(socket) => send_all(&socket, payload).await,
                Err(e) => Err(e),
            },
        };
        result.map_err(|source| TunnelError::Routing { dest, source })
    }

    async fn socket_for(
        &self,
        registry: &Mutex<HashMap<SocketAddrV4, Arc<UdpSocket>>>,
        dest: SocketAddrV4,
    ) -> io::Result<Arc<UdpSocket>> {
        let existing = lock(registry).get(&dest).cloned();
        if let Some(socket) = existing {
            return Ok(socket);
        }

        let opened = Arc::new(open_socket(dest).await?);
        let socket = Arc::clone(lock(registry).entry(dest).or_insert(opened));
        tracing::debug!(%dest, "Opened egress socket");
        Ok(socket)
    }
}

impl std::fmt::Debug for UdpRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRouter")
            .field("override_target", &self.override_target())
            .field("open_sockets", &self.open_sockets())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn open_socket(dest: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(dest).await?;
    Ok(socket)
}

async fn send_all(socket: &UdpSocket, payload: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    loop {
        let n = socket.send(&payload[sent..]).await?;
        sent += n;
        if sent >= payload.len() {
            return Ok(());
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "UDP send made no progress",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn local_receiver() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
            panic!("expected IPv4 address");
        };
        (socket, addr)
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let n = timeout(Duration::from_secs(5), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_per_destination_reuses_socket() {
        let (receiver, addr) = local_receiver().await;
        let router = UdpRouter::per_destination();
        assert_eq!(router.open_sockets(), 0);

        router.route(addr, b"one").await.unwrap();
        router.route(addr, b"two").await.unwrap();
        assert_eq!(router.open_sockets(), 1);

        assert_eq!(recv(&receiver).await, b"one");
        assert_eq!(recv(&receiver).await, b"two");
    }

    #[tokio::test]
    async fn test_distinct_destinations_get_distinct_sockets() {
        let (a, addr_a) = local_receiver().await;
        let (b, addr_b) = local_receiver().await;
        let router = UdpRouter::per_destination();

        router.route(addr_a, b"for a").await.unwrap();
        router.route(addr_b, b"for b").await.unwrap();
        assert_eq!(router.open_sockets(), 2);

        assert_eq!(recv(&a).await, b"for a");
        assert_eq!(recv(&b).await, b"for b");
    }

    #[tokio::test]
    async fn test_override_ignores_declared_destination() {
        let (receiver, addr) = local_receiver().await;
        let router = UdpRouter::with_override(addr).await.unwrap();
        assert_eq!(router.override_target(), Some(addr));

        let declared = SocketAddrV4::new(Ipv4Addr::new(239, 1, 1, 1), 5000);
        router.route(declared, &[9u8; 100]).await.unwrap();
        assert_eq!(recv(&receiver).await, vec![9u8; 100]);
    }

    #[tokio::test]
    async fn test_from_config_selects_mode() {
        let router = UdpRouter::from_config(&TunnelConfig::default())
            .await
            .unwrap();
        assert_eq!(router.override_target(), None);

        let (_receiver, addr) = local_receiver().await;
        let config = TunnelConfig::new().udp_override(Some(addr));
        let router = UdpRouter::from_config(&config).await.unwrap();
        assert_eq!(router.override_target(), Some(addr));
    }

    #[tokio::test]
    async fn test_empty_datagram_is_sent() {
        let (receiver, addr) = local_receiver().await;
        let router = UdpRouter::per_destination();
        router.route(addr, &[]).await.unwrap();
        assert_eq!(recv(&receiver).await, Vec::<u8>::new());
    }
}
