//! Pool of short-lived byte buffers rented per operation.
//!
//! Read paths that do not hand ownership to the root pipeline borrow a
//! buffer here instead of allocating. The rental is a guard: buffers return
//! to the pool on every exit path, including failures.

use parking_lot::Mutex;

/// How many spare buffers the pool retains. Extra returns are dropped.
const MAX_POOLED: usize = 16;

#[derive(Debug, Default)]
pub struct BufferPool {
    spares: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rent a buffer of exactly `len` bytes (zero-extended if the spare was
    /// shorter).
    #[must_use]
    pub fn rent(&self, len: usize) -> PooledBuf<'_> {
        let mut buf = self.spares.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        PooledBuf { pool: self, buf }
    }

    fn put_back(&self, buf: Vec<u8>) {
        let mut spares = self.spares.lock();
        if spares.len() < MAX_POOLED {
            spares.push(buf);
        }
    }
}

/// A rented buffer; returns to the pool on drop.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl PooledBuf<'_> {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.put_back(std::mem::take(&mut self.buf));
    }
}
