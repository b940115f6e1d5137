//! Fixed-capacity buffer pool.
//!
//! K equal-sized buffers are allocated once at startup. Each
//! [`acquire`](BufferPool::acquire) hands out a [`PooledBuf`], a move-only
//! token that returns its buffer to the pool when dropped.
//!
//! | Request                     | Served by                          |
//! |-----------------------------|------------------------------------|
//! | `size <= buffer_size`, free | next free pool slot (hit)          |
//! | `size <= buffer_size`, none | direct tier allocation (exhausted) |
//! | `size > buffer_size`        | direct tier allocation (bypass)    |
//!
//! Acquisition never blocks. It fails only when both memory tiers are out
//! of memory.

pub mod tier;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::error::StreamError;

pub use tier::{BulkTier, HeapTier, MemoryTier, TierBuf, TieredAllocator};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Stats ────────────────────────────────────────────────────────

/// Pool usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub acquisitions: u64,
    pub pool_hits: u64,
    pub bypass: u64,
    pub exhausted: u64,
    pub in_use: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct PoolCounters {
    acquisitions: AtomicU64,
    pool_hits: AtomicU64,
    bypass: AtomicU64,
    exhausted: AtomicU64,
}

// ── BufferPool ───────────────────────────────────────────────────

struct PoolShared {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<TierBuf>>,
    allocator: TieredAllocator,
    counters: PoolCounters,
}

/// A pool of pre-allocated byte buffers. Cheap to clone.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_size` bytes from `allocator`.
    ///
    /// Failure here is resource-fatal: the caller should abort startup.
    pub fn new(
        count: usize,
        buffer_size: usize,
        allocator: TieredAllocator,
    ) -> Result<Self, StreamError> {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            free.push(allocator.allocate(buffer_size)?);
        }
        debug!("buffer pool ready: {count} x {buffer_size} bytes");

        Ok(Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                capacity: count,
                free: Mutex::new(free),
                allocator,
                counters: PoolCounters::default(),
            }),
        })
    }

    /// Hand out a cleared buffer with room for at least `size` bytes.
    pub fn acquire(&self, size: usize) -> Result<PooledBuf, StreamError> {
        let shared = &self.shared;
        shared.counters.acquisitions.fetch_add(1, Ordering::Relaxed);

        if size > shared.buffer_size {
            shared.counters.bypass.fetch_add(1, Ordering::Relaxed);
            let buf = shared.allocator.allocate(size)?;
            return Ok(PooledBuf::direct(buf, Arc::clone(shared)));
        }

        let pooled = lock(&shared.free).pop();
        match pooled {
            Some(mut buf) => {
                shared.counters.pool_hits.fetch_add(1, Ordering::Relaxed);
                buf.vec_mut().clear();
                Ok(PooledBuf {
                    buf,
                    pooled: true,
                    shared: Arc::clone(shared),
                })
            }
            None => {
                shared.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                debug!("buffer pool exhausted, allocating {size} bytes directly");
                let buf = shared.allocator.allocate(size)?;
                Ok(PooledBuf::direct(buf, Arc::clone(shared)))
            }
        }
    }

    /// Size class of the pooled buffers.
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Free pool slots right now.
    pub fn available(&self) -> usize {
        lock(&self.shared.free).len()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            acquisitions: c.acquisitions.load(Ordering::Relaxed),
            pool_hits: c.pool_hits.load(Ordering::Relaxed),
            bypass: c.bypass.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            in_use: self.shared.capacity - self.available(),
            capacity: self.shared.capacity,
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .finish()
    }
}

// ── PooledBuf ────────────────────────────────────────────────────

/// Ownership token for one buffer.
///
/// Not `Clone`: exactly one owner exists, and the buffer goes back to the
/// pool (or to its tier, for direct allocations) exactly once, on drop.
pub struct PooledBuf {
    buf: TierBuf,
    pooled: bool,
    shared: Arc<PoolShared>,
}

impl PooledBuf {
    fn direct(buf: TierBuf, shared: Arc<PoolShared>) -> Self {
        Self {
            buf,
            pooled: false,
            shared,
        }
    }

    /// Whether this buffer came from a pool slot.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// The backing vector, for appending.
    ///
    /// Growing a buffer past its reserved size is allowed; the tier
    /// accounting keeps the original reservation.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        self.buf.vec_mut()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.vec_mut().extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.vec_mut().clear();
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_slice()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len())
            .field("pooled", &self.pooled)
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        // Direct buffers release their tier reservation in `TierBuf::drop`.
        if self.pooled {
            let buf = self.buf.take();
            lock(&self.shared.free).push(buf);
        }
    }
}
