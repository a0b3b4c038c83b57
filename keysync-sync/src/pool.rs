//! Reusable byte buffers for encoding document-store payloads.
//!
//! The pool is an ordinary value owned by whoever needs it (the orchestrator
//! holds one); there is no process-wide instance.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const DEFAULT_CAPACITY: usize = 4096;
const DEFAULT_MAX_POOLED: usize = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub alloc_count: u64,
    pub reuse_count: u64,
}

#[derive(Debug)]
struct Shared {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_pooled: usize,
    alloc_count: AtomicU64,
    reuse_count: AtomicU64,
}

/// A bounded free-list of `Vec<u8>`. Cloning shares the free-list.
#[derive(Debug, Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_POOLED)
    }
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::new()),
                buffer_capacity,
                max_pooled,
                alloc_count: AtomicU64::new(0),
                reuse_count: AtomicU64::new(0),
            }),
        }
    }

    /// Take an empty buffer; it goes back to the pool when dropped.
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self.free_list().pop();
        let buf = match reused {
            Some(buf) => {
                self.shared.reuse_count.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.shared.alloc_count.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.shared.buffer_capacity)
            }
        };
        PooledBuffer {
            buf,
            pool: self.shared.clone(),
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            alloc_count: self.shared.alloc_count.load(Ordering::Relaxed),
            reuse_count: self.shared.reuse_count.load(Ordering::Relaxed),
        }
    }

    /// Buffers currently sitting idle in the pool.
    pub fn idle(&self) -> usize {
        self.free_list().len()
    }

    fn free_list(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.shared
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<Shared>,
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
        // Oversized buffers are dropped so one huge document does not pin memory.
        if buf.capacity() > self.pool.buffer_capacity * 4 {
            return;
        }
        let mut free = self
            .pool
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if free.len() < self.pool.max_pooled {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused_and_cleared() {
        let pool = BufferPool::new(64, 2);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"payload");
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(
            pool.stats(),
            BufferPoolStats {
                alloc_count: 1,
                reuse_count: 1
            }
        );
    }

    #[test]
    fn pool_never_holds_more_than_max() {
        let pool = BufferPool::new(64, 2);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn oversized_buffers_are_not_returned() {
        let pool = BufferPool::new(8, 2);
        {
            let mut buf = pool.acquire();
            buf.resize(1024, 0);
        }
        assert_eq!(pool.idle(), 0);
    }
}
