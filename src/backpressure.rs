//! Bounded outbound datagram queue.
//!
//! The capture loop hands each datagram to a [`DatagramSender`]; the
//! multiplexer drains the matching receiver. The queue has a fixed capacity.
//! When the TCP connection cannot keep up, the queue fills and `send` waits,
//! which in turn lets the kernel's socket buffer fill and drop new multicast
//! packets. Recent traffic wins over complete traffic under sustained
//! overload.
//!
//! # Usage
//!
//! ```ignore
//! let (sender, rx) = datagram_queue(4096);
//! let writer = spawn_multiplexer(write_half, rx, config.heartbeat_interval());
//! sender.send(datagram).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Result, TunnelError};
use crate::writer::OutboundDatagram;

/// Create a bounded datagram queue.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn datagram_queue(capacity: usize) -> (DatagramSender, mpsc::Receiver<OutboundDatagram>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = DatagramSender {
        tx,
        saturated: Arc::new(AtomicBool::new(false)),
    };
    (sender, rx)
}

/// Producer side of the outbound queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DatagramSender {
    tx: mpsc::Sender<OutboundDatagram>,
    /// Set while the queue is full, so saturation is logged once per episode.
    saturated: Arc<AtomicBool>,
}

impl DatagramSender {
    /// Enqueue a datagram, waiting while the queue is full.
    ///
    /// Returns `ConnectionClosed` once the multiplexer has stopped.
    pub async fn send(&self, datagram: OutboundDatagram) -> Result<()> {
        match self.tx.try_send(datagram) {
            Ok(()) => {
                if self.saturated.swap(false, Ordering::AcqRel) {
                    tracing::info!("Outbound queue drained, capture resumed");
                }
                Ok(())
            }
            Err(TrySendError::Full(datagram)) => {
                if !self.saturated.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        capacity = self.capacity(),
                        "Outbound queue full, capture waiting on the server connection"
                    );
                }
                self.tx
                    .send(datagram)
                    .await
                    .map_err(|_| TunnelError::ConnectionClosed)
            }
            Err(TrySendError::Closed(_)) => Err(TunnelError::ConnectionClosed),
        }
    }

    /// Enqueue without waiting.
    ///
    /// Returns `QueueFull` immediately if at capacity.
    pub fn try_send(&self, datagram: OutboundDatagram) -> Result<()> {
        self.tx.try_send(datagram).map_err(|e| match e {
            TrySendError::Full(_) => TunnelError::QueueFull,
            TrySendError::Closed(_) => TunnelError::ConnectionClosed,
        })
    }

    /// Datagrams queued and not yet taken by the multiplexer.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Maximum queued datagrams.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Check if the queue is currently full.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.tx.capacity() == 0
    }

    /// Check if the multiplexer has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    fn datagram(pool: &BufferPool, byte: u8) -> OutboundDatagram {
        let dest = SocketAddrV4::new(Ipv4Addr::new(239, 1, 1, 1), 5000);
        OutboundDatagram::copy_from(pool, dest, &[byte; 4]).unwrap()
    }

    #[tokio::test]
    async fn test_pending_count() {
        let pool = BufferPool::new(8);
        let (sender, mut rx) = datagram_queue(4);
        assert_eq!(sender.capacity(), 4);
        assert_eq!(sender.pending_count(), 0);

        sender.send(datagram(&pool, 1)).await.unwrap();
        sender.send(datagram(&pool, 2)).await.unwrap();
        assert_eq!(sender.pending_count(), 2);
        assert!(!sender.is_backpressure_active());

        rx.recv().await.unwrap();
        assert_eq!(sender.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let pool = BufferPool::new(8);
        let (sender, _rx) = datagram_queue(1);

        sender.try_send(datagram(&pool, 1)).unwrap();
        assert!(sender.is_backpressure_active());

        let result = sender.try_send(datagram(&pool, 2));
        assert!(matches!(result, Err(TunnelError::QueueFull)));
        // The rejected datagram's buffer went back to the pool.
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[tokio::test]
    async fn test_send_waits_until_space() {
        let pool = BufferPool::new(8);
        let (sender, mut rx) = datagram_queue(1);
        sender.send(datagram(&pool, 1)).await.unwrap();

        let blocked = {
            let sender = sender.clone();
            let d = datagram(&pool, 2);
            tokio::spawn(async move { sender.send(d).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload(), &[1; 4]);

        blocked.await.unwrap().unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload(), &[2; 4]);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let pool = BufferPool::new(8);
        let (sender, rx) = datagram_queue(4);
        drop(rx);

        assert!(sender.is_closed());
        let result = sender.send(datagram(&pool, 1)).await;
        assert!(matches!(result, Err(TunnelError::ConnectionClosed)));
        assert_eq!(pool.stats().outstanding, 0);
    }
}
