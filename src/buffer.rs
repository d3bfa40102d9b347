//! Process-wide receive buffer pool.
//!
//! Connections check a buffer out when they are accepted and check it back
//! in when they are disposed, so steady-state traffic does not allocate a
//! fresh receive buffer per client. The pool is shared by every connection
//! task and guarded by a single short critical section.
//!
//! Exhaustion is not an error: `checkout` falls back to a one-off
//! allocation that is simply dropped (or adopted) on checkin.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Buffers that grew beyond this multiple of the nominal size are not kept.
const MAX_GROWTH_FACTOR: usize = 8;

/// Shared pool of fixed-size byte buffers.
///
/// Free buffers are kept on a LIFO stack for cache locality.
pub struct BufferPool {
    /// Stack of available buffers.
    free_list: Mutex<Vec<BytesMut>>,
    /// Nominal size of each buffer.
    buffer_size: usize,
    /// Number of buffers the pool retains.
    capacity: usize,
    /// Checkouts served by a one-off allocation because the pool was empty.
    one_off: AtomicU64,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let free_list = (0..count).map(|_| BytesMut::with_capacity(size)).collect();

        Self {
            free_list: Mutex::new(free_list),
            buffer_size: size,
            capacity: count,
            one_off: AtomicU64::new(0),
        }
    }

    /// Take a buffer out of the pool.
    ///
    /// Never fails: when the pool is empty a one-off buffer of the nominal
    /// size is allocated instead.
    pub fn checkout(&self) -> BytesMut {
        if let Some(buf) = self.free_list.lock().pop() {
            return buf;
        }
        self.one_off.fetch_add(1, Ordering::Relaxed);
        trace!(size = self.buffer_size, "Buffer pool exhausted, allocating one-off buffer");
        BytesMut::with_capacity(self.buffer_size)
    }

    /// Return a buffer to the pool.
    ///
    /// Contents are discarded. Buffers are dropped instead of retained when
    /// the pool is already full or the buffer grew far past the nominal size.
    pub fn checkin(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() > self.buffer_size * MAX_GROWTH_FACTOR {
            buf = BytesMut::with_capacity(self.buffer_size);
        } else {
            buf.reserve(self.buffer_size);
        }

        let mut free = self.free_list.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Get the size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the total number of buffers the pool retains.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of available buffers.
    pub fn available(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Number of checkouts that had to allocate because the pool was empty.
    pub fn one_off_allocations(&self) -> u64 {
        self.one_off.load(Ordering::Relaxed)
    }
}
