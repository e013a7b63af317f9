//! Reusable I/O buffers for chunk workers
//!
//! Workers stage response bytes in a [`PooledBuffer`] until a full
//! `buffer_size` slice is ready to write. The guard hands its allocation
//! back to the pool when dropped, on every exit path.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool of `buffer_size` buffers, keeping at most `max_pooled` idle
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_pooled)),
                buffer_size,
                max_pooled,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of idle buffers ready for reuse
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Take an empty buffer with `buffer_size` capacity
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_size));
        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }
}

/// A buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Bytes that still fit before the buffer reaches `buffer_size`
    pub fn spare(&self) -> usize {
        self.pool.buffer_size.saturating_sub(self.len())
    }

    pub fn is_full(&self) -> bool {
        self.spare() == 0
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.max_pooled {
            free.push(buf);
        }
    }
}
