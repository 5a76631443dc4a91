//! Shared pool of read buffers.

use bytes::BytesMut;
use std::sync::{Mutex, MutexGuard};

/// Default capacity of a pooled buffer (64 KiB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Default number of idle buffers kept
pub const DEFAULT_MAX_POOLED: usize = 64;

/// Recycles connection read buffers
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `capacity` bytes
    pub fn new(capacity: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            capacity,
            max_pooled,
        }
    }

    /// Take an empty buffer, allocating if none is idle
    pub fn acquire(&self) -> BytesMut {
        self.lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity))
    }

    /// Return a buffer; its contents are discarded
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut buffers = self.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    /// Capacity of newly allocated buffers
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_POOLED)
    }
}
