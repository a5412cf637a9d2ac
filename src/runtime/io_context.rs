//! Pooled per-connection I/O contexts (spec.md §4.2).
//!
//! An [`IoContext`] bundles the reusable scratch buffer a connection reads
//! both its header and its body into. Pooling these bounds the number of
//! buffer allocations to the high-water mark of concurrent connections
//! instead of allocating fresh storage per accepted socket.

use crate::codec::HEADER_SIZE;
use std::sync::Mutex;

/// Reusable per-connection scratch buffer.
///
/// The buffer backs the 6-byte header read and is then resized in place to
/// back the variable-length body read, so a single allocation is reused for
/// both halves of a frame and across a connection's whole lifetime.
#[derive(Debug, Default)]
pub struct IoContext {
    pub buf: Vec<u8>,
}

impl IoContext {
    fn fresh() -> Self {
        Self {
            buf: vec![0u8; HEADER_SIZE],
        }
    }
}

/// Thread-safe LIFO stack of reusable [`IoContext`]s.
///
/// `pop` never blocks on a miss: the caller gets a freshly allocated
/// context instead of waiting for one to be returned. The pool has no
/// upper bound and never shrinks — it grows to the peak number of
/// concurrent connections observed, an intentional simplification carried
/// over from spec.md §5. Rust's ownership model makes "pushing null"
/// unrepresentable, so the programmer-error case spec.md §4.2 calls out
/// for that is structurally impossible here rather than checked at
/// runtime.
pub struct IoContextPool {
    free: Mutex<Vec<IoContext>>,
}

impl IoContextPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pop a context from the pool, allocating a fresh one on a miss.
    pub fn pop(&self) -> IoContext {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(IoContext::fresh)
    }

    /// Return a context to the pool for reuse by a future connection.
    pub fn push(&self, mut ctx: IoContext) {
        ctx.buf.clear();
        ctx.buf.resize(HEADER_SIZE, 0);
        self.free.lock().unwrap().push(ctx);
    }

    /// Advisory count of currently pooled (idle) contexts.
    pub fn count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for IoContextPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_allocates_fresh_on_empty_pool() {
        let pool = IoContextPool::new();
        assert_eq!(pool.count(), 0);
        let ctx = pool.pop();
        assert_eq!(ctx.buf.len(), HEADER_SIZE);
    }

    #[test]
    fn push_resets_buffer_before_reuse() {
        let pool = IoContextPool::new();
        let mut ctx = pool.pop();
        ctx.buf.resize(4096, 0xAA);
        pool.push(ctx);
        assert_eq!(pool.count(), 1);

        let reused = pool.pop();
        assert_eq!(reused.buf.len(), HEADER_SIZE);
        assert!(reused.buf.iter().all(|&b| b == 0));
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn pool_is_lifo() {
        let pool = IoContextPool::new();
        let a = pool.pop();
        let b = pool.pop();
        pool.push(a);
        pool.push(b);
        assert_eq!(pool.count(), 2);
    }
}
