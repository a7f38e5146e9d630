//! Global buffer pool for wire packet assembly, AEAD scratch space and relay
//! copies.
//!
//! 128 KiB covers the largest mux frame plus padding and framing overhead.
//! Buffers are handed out as RAII guards so every exit path returns them; a
//! request larger than the pooled size falls back to a direct allocation that
//! is simply dropped instead of stalling.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Size of each pooled buffer.
pub const POOL_BUF_SIZE: usize = 128 * 1024;

/// Upper bound on idle buffers retained by the pool.
const MAX_POOLED: usize = 64;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// A buffer borrowed from the global pool, returned on drop.
///
/// Dereferences to `Vec<u8>`; handed out empty (`len() == 0`) with at least
/// the requested capacity.
pub struct PooledBuf {
    buf: Vec<u8>,
}

impl PooledBuf {
    /// Borrows a standard 128 KiB buffer.
    pub fn take() -> Self {
        let buf = POOL
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(POOL_BUF_SIZE));
        Self { buf }
    }

    /// Borrows a buffer with at least `capacity` bytes. Oversized requests
    /// bypass the pool entirely.
    pub fn with_capacity(capacity: usize) -> Self {
        if capacity <= POOL_BUF_SIZE {
            Self::take()
        } else {
            Self {
                buf: Vec::with_capacity(capacity),
            }
        }
    }

    /// Zero-fills the buffer to full pooled length and returns it as a
    /// mutable slice, for use as a read destination.
    pub fn as_read_buf(&mut self) -> &mut [u8] {
        let cap = self.buf.capacity();
        self.buf.resize(cap, 0);
        &mut self.buf
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        // Only pool-sized buffers go back; fallback allocations just drop.
        if self.buf.capacity() == POOL_BUF_SIZE {
            let mut pool = match POOL.lock() {
                Ok(p) => p,
                Err(_) => return,
            };
            if pool.len() < MAX_POOLED {
                let mut buf = std::mem::take(&mut self.buf);
                buf.clear();
                pool.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_return() {
        let mut b = PooledBuf::take();
        assert_eq!(b.len(), 0);
        assert!(b.capacity() >= POOL_BUF_SIZE);
        b.extend_from_slice(b"hello");
        drop(b);

        // The returned buffer comes back cleared.
        let b2 = PooledBuf::take();
        assert_eq!(b2.len(), 0);
    }

    #[test]
    fn test_oversized_falls_back() {
        let b = PooledBuf::with_capacity(POOL_BUF_SIZE * 4);
        assert!(b.capacity() >= POOL_BUF_SIZE * 4);
    }

    #[test]
    fn test_read_buf_full_length() {
        let mut b = PooledBuf::take();
        let s = b.as_read_buf();
        assert_eq!(s.len(), POOL_BUF_SIZE);
    }
}
