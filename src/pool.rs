//! Reusable byte buffers for the datagram hot path.
//!
//! Multicast traffic can arrive at high packet rates. Allocating and freeing
//! a buffer per packet would dominate latency, so buffers are recycled
//! through a shared pool instead.
//!
//! # Ownership
//!
//! A [`PooledBuffer`] has exactly one owner at a time. It moves from the
//! capture loop to the outbound queue to the writer task, and goes back to
//! the pool when the last owner drops it or calls [`PooledBuffer::release`].
//! Release consumes the buffer, so releasing twice or touching a released
//! buffer does not compile.
//!
//! # Example
//!
//! ```
//! use udp_tunneler::pool::BufferPool;
//!
//! let pool = BufferPool::new(16);
//! let mut buf = pool.acquire(1500);
//! buf[0] = 0x02;
//! buf.release();
//!
//! assert_eq!(pool.stats().outstanding, 0);
//! assert_eq!(pool.stats().idle, 1);
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;

/// Default number of idle buffers kept for reuse.
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 1024;

struct PoolInner {
    idle: Mutex<Vec<BytesMut>>,
    max_idle: usize,
    outstanding: AtomicUsize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        // A panic while holding the lock cannot leave the Vec inconsistent.
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers acquired and not yet released.
    pub outstanding: usize,
    /// Buffers currently idle in the pool.
    pub idle: usize,
    /// Acquisitions served by a fresh allocation.
    pub allocated: u64,
    /// Acquisitions served by an idle buffer.
    pub reused: u64,
}

/// Shared pool of byte buffers. Cheap to clone.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool that keeps at most `max_idle` released buffers.
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
                max_idle,
                outstanding: AtomicUsize::new(0),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a buffer of exactly `size` bytes.
    ///
    /// The contents are zeroed for fresh allocations and may hold stale bytes
    /// when reused up to the old length; callers overwrite what they read.
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        let recycled = self.inner.idle().pop();

        let buf = match recycled {
            Some(mut buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(size, 0);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::zeroed(size)
            }
        };

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            pool: self.inner.clone(),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            idle: self.inner.idle().len(),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_BUFFERS)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_idle", &self.inner.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Shorten the buffer to `len` bytes. No-op if already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Allocated capacity backing this buffer.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Return the buffer to its pool.
    ///
    /// Equivalent to dropping it; spelled out at hand-off points.
    #[inline]
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);

        let mut idle = self.pool.idle();
        if idle.len() < self.pool.max_idle {
            idle.push(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_exact_size() {
        let pool = BufferPool::new(4);
        let buf = pool.acquire(1509);
        assert_eq!(buf.len(), 1509);
        assert!(buf.capacity() >= 1509);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_release_returns_to_pool() {
        let pool = BufferPool::new(4);

        let buf = pool.acquire(64);
        assert_eq!(pool.stats().outstanding, 1);
        assert_eq!(pool.stats().idle, 0);

        buf.release();
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.allocated, 1);
    }

    #[test]
    fn test_released_storage_is_reused() {
        let pool = BufferPool::new(4);

        let buf = pool.acquire(256);
        let ptr = buf.as_ptr();
        drop(buf);

        let buf = pool.acquire(128);
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(buf.len(), 128);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
    }

    #[test]
    fn test_reuse_grows_when_needed() {
        let pool = BufferPool::new(4);
        drop(pool.acquire(16));

        let buf = pool.acquire(4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_idle_limit() {
        let pool = BufferPool::new(2);
        let buffers: Vec<_> = (0..5).map(|_| pool.acquire(8)).collect();
        assert_eq!(pool.stats().outstanding, 5);

        drop(buffers);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 2);
    }

    #[test]
    fn test_concurrent_owners_get_distinct_buffers() {
        let pool = BufferPool::new(4);
        let mut a = pool.acquire(8);
        let mut b = pool.acquire(8);
        a[0] = 1;
        b[0] = 2;
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(a[0], 1);
        assert_eq!(b[0], 2);
    }

    #[test]
    fn test_truncate() {
        let pool = BufferPool::new(1);
        let mut buf = pool.acquire(100);
        buf.truncate(20);
        assert_eq!(buf.len(), 20);
        buf.truncate(50);
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn test_pool_shared_across_threads() {
        let pool = BufferPool::new(8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.acquire(32);
                        buf[31] = 0xFF;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.allocated + stats.reused, 400);
    }
}
