//! Process-wide datagram buffer pool.
//!
//! Buffers are created lazily, handed out as [`PooledBuf`], and go back to
//! the pool when the `PooledBuf` is dropped, ie. once the write that consumed
//! the datagram has completed. The pool keeps at most `max_pooled` idle
//! buffers; anything beyond that is simply freed.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

/// Maximum UDP payload size.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Idle buffers kept by the global pool.
const DEFAULT_MAX_POOLED: usize = 256;

static GLOBAL_POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();

pub struct BufferPool {
    buffers: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled.min(64))),
            buffer_size,
            max_pooled,
        })
    }

    /// The pool shared by every endpoint in the process.
    pub fn global() -> &'static Arc<BufferPool> {
        GLOBAL_POOL.get_or_init(|| BufferPool::new(MAX_DATAGRAM_SIZE, DEFAULT_MAX_POOLED))
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Takes an idle buffer, or allocates a new one if none is available.
    ///
    /// The returned buffer has length 0; use [`PooledBuf::spare_mut`] to read
    /// into it and [`PooledBuf::set_len`] to mark the filled region.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        PooledBuf {
            buf: Some(buf),
            len: 0,
            pool: self.clone(),
        }
    }

    /// Copies `data` into a pooled buffer.
    pub fn acquire_from(self: &Arc<Self>, data: &[u8]) -> std::io::Result<PooledBuf> {
        if data.len() > self.buffer_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "datagram of {} bytes exceeds buffer size {}",
                    data.len(),
                    self.buffer_size
                ),
            ));
        }
        let mut buf = self.acquire();
        buf.spare_mut()[..data.len()].copy_from_slice(data);
        buf.set_len(data.len());
        Ok(buf)
    }

    /// Number of idle buffers currently held.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    fn release(&self, buf: Box<[u8]>) {
        if buf.len() != self.buffer_size {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_pooled", &self.max_pooled)
            .field("available", &self.available())
            .finish()
    }
}

/// A datagram buffer borrowed from a [`BufferPool`].
///
/// Dereferences to the filled region only.
pub struct PooledBuf {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// The whole underlying buffer, for reading a datagram into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        match self.buf.as_mut() {
            Some(buf) => buf,
            None => &mut [],
        }
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "length exceeds buffer capacity");
        self.len = len;
    }

    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |buf| buf.len())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.buf.as_ref() {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match self.buf.as_mut() {
            Some(buf) => &mut buf[..len],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len).finish()
    }
}
