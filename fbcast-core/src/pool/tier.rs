//! Memory tiers and the two-tier allocation policy.
//!
//! ```text
//!   TieredAllocator::allocate(size)
//!        │
//!        ├── preferred.allocate(size) ── Some ──▶ TierBuf (origin = preferred)
//!        │            │
//!        │           None
//!        │            ▼
//!        └── fallback.allocate(size) ─── Some ──▶ TierBuf (origin = fallback)
//!                     │
//!                    None ──▶ StreamError::ResourceExhausted
//! ```
//!
//! A [`TierBuf`] remembers which tier it came from and hands its bytes
//! back to that tier when dropped, so callers never need to track origin.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::warn;

use crate::error::StreamError;

/// A named source of byte buffers.
pub trait MemoryTier: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Allocate a buffer with at least `size` bytes of capacity and
    /// length zero, or `None` when the tier cannot serve the request.
    fn allocate(&self, size: usize) -> Option<Vec<u8>>;

    /// Return `size` bytes previously handed out by [`allocate`](Self::allocate).
    fn release(&self, size: usize);
}

// ── HeapTier ─────────────────────────────────────────────────────

/// The general-purpose allocator. Out-of-memory is detected with
/// `try_reserve_exact` instead of aborting.
#[derive(Debug, Default)]
pub struct HeapTier;

impl MemoryTier for HeapTier {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn allocate(&self, size: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        Some(buf)
    }

    fn release(&self, _size: usize) {}
}

// ── BulkTier ─────────────────────────────────────────────────────

/// A bounded bulk region (external RAM on the original hardware).
///
/// Serves allocations until its byte budget is used up.
#[derive(Debug)]
pub struct BulkTier {
    budget: usize,
    used: AtomicUsize,
}

impl BulkTier {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}

impl MemoryTier for BulkTier {
    fn name(&self) -> &'static str {
        "bulk"
    }

    fn allocate(&self, size: usize) -> Option<Vec<u8>> {
        let reserved = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.budget)
            })
            .is_ok();
        if !reserved {
            return None;
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            self.used.fetch_sub(size, Ordering::AcqRel);
            return None;
        }
        Some(buf)
    }

    fn release(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }
}

// ── TierBuf ──────────────────────────────────────────────────────

/// A byte buffer tagged with the tier that owns its memory.
///
/// Dropping it releases the reservation back to that tier.
pub struct TierBuf {
    data: Vec<u8>,
    reserved: usize,
    tier: Arc<dyn MemoryTier>,
}

impl TierBuf {
    /// Bytes reserved from the tier (the buffer's nominal capacity).
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn tier_name(&self) -> &'static str {
        self.tier.name()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Direct access to the backing vector.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Move the buffer and its reservation out, leaving an empty
    /// zero-reservation buffer behind.
    pub(crate) fn take(&mut self) -> TierBuf {
        TierBuf {
            data: std::mem::take(&mut self.data),
            reserved: std::mem::replace(&mut self.reserved, 0),
            tier: Arc::clone(&self.tier),
        }
    }
}

impl fmt::Debug for TierBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierBuf")
            .field("len", &self.data.len())
            .field("reserved", &self.reserved)
            .field("tier", &self.tier.name())
            .finish()
    }
}

impl Drop for TierBuf {
    fn drop(&mut self) {
        self.tier.release(self.reserved);
    }
}

// ── TieredAllocator ──────────────────────────────────────────────

/// Allocation policy: try `preferred`, then `fallback`.
#[derive(Debug, Clone)]
pub struct TieredAllocator {
    preferred: Arc<dyn MemoryTier>,
    fallback: Option<Arc<dyn MemoryTier>>,
    degraded: Arc<AtomicBool>,
}

impl TieredAllocator {
    pub fn new(preferred: Arc<dyn MemoryTier>, fallback: Option<Arc<dyn MemoryTier>>) -> Self {
        Self {
            preferred,
            fallback,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Plain heap, no second tier.
    pub fn heap() -> Self {
        Self::new(Arc::new(HeapTier), None)
    }

    /// A bulk region of `budget` bytes backed by the heap.
    ///
    /// A zero budget yields [`heap`](Self::heap).
    pub fn bulk_then_heap(budget: usize) -> Self {
        if budget == 0 {
            return Self::heap();
        }
        Self::new(Arc::new(BulkTier::new(budget)), Some(Arc::new(HeapTier)))
    }

    /// Allocate a zero-length buffer with `size` bytes of capacity.
    pub fn allocate(&self, size: usize) -> Result<TierBuf, StreamError> {
        if let Some(data) = self.preferred.allocate(size) {
            return Ok(TierBuf {
                data,
                reserved: size,
                tier: Arc::clone(&self.preferred),
            });
        }

        let Some(fallback) = &self.fallback else {
            return Err(StreamError::ResourceExhausted {
                what: self.preferred.name(),
                requested: size,
            });
        };

        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                "{} tier exhausted, falling back to {} allocations",
                self.preferred.name(),
                fallback.name()
            );
        }

        fallback
            .allocate(size)
            .map(|data| TierBuf {
                data,
                reserved: size,
                tier: Arc::clone(fallback),
            })
            .ok_or(StreamError::ResourceExhausted {
                what: fallback.name(),
                requested: size,
            })
    }

    /// Allocate and zero-fill `size` bytes.
    pub fn allocate_zeroed(&self, size: usize) -> Result<TierBuf, StreamError> {
        let mut buf = self.allocate(size)?;
        buf.data.resize(size, 0);
        Ok(buf)
    }

    /// Whether the preferred tier has ever failed to serve a request.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}
