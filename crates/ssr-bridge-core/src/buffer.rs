//! Pooled byte buffers for copying stream chunks out of the runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A pool of reusable byte buffers.
///
/// Buffers are rented per chunk and go back to the pool when the
/// [`RentedBuffer`] is dropped, on every path.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    max_idle: usize,
    outstanding: AtomicUsize,
    rented_total: AtomicU64,
}

impl BufferPool {
    /// Create a pool of buffers with `capacity` bytes reserved up front,
    /// keeping at most `max_idle` idle buffers.
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                capacity,
                max_idle,
                outstanding: AtomicUsize::new(0),
                rented_total: AtomicU64::new(0),
            }),
        }
    }

    /// Rent an empty buffer.
    pub fn rent(&self) -> RentedBuffer {
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.capacity));
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        self.inner.rented_total.fetch_add(1, Ordering::Relaxed);
        RentedBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers currently rented and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// Total number of rentals since the pool was created.
    pub fn rented_total(&self) -> u64 {
        self.inner.rented_total.load(Ordering::Relaxed)
    }

    /// Idle buffers ready for reuse.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("outstanding", &self.outstanding())
            .field("idle", &self.idle())
            .finish_non_exhaustive()
    }
}

/// A buffer rented from a [`BufferPool`].
pub struct RentedBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl RentedBuffer {
    /// Append bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The filled bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl std::ops::Deref for RentedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for RentedBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        {
            let mut idle = self.pool.idle.lock();
            if idle.len() < self.pool.max_idle {
                idle.push(buf);
            }
        }
        self.pool.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_and_return() {
        let pool = BufferPool::new(16, 4);

        let mut a = pool.rent();
        a.extend_from_slice(b"hello");
        assert_eq!(a.as_slice(), b"hello");
        assert_eq!(pool.outstanding(), 1);

        drop(a);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);

        let b = pool.rent();
        assert!(b.is_empty());
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.rented_total(), 2);
    }

    #[test]
    fn test_idle_is_bounded() {
        let pool = BufferPool::new(8, 1);

        let a = pool.rent();
        let b = pool.rent();
        drop(a);
        drop(b);

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.outstanding(), 0);
    }
}
