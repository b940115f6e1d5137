//! Bounded frame queue between the producer and the network pump.
//!
//! ```text
//!   producer                       FrameQueue (depth N)                 pump
//!   ────────                  ┌──────┬──────┬─────┐                   ────
//!   acquire_write_slot() ───▶ │ slot │ slot │ ... │ ───▶ next_readable()
//!   WriteSlot::submit()       └──────┴──────┴─────┘      ReadSlot::release()
//!                              write_idx   read_idx   count
//! ```
//!
//! All slots are allocated once. When every slot is in flight the
//! **newest** request is refused (`acquire_write_slot` returns `None`);
//! a frame the consumer has not released is never overwritten.
//!
//! Single producer, single consumer. Indices and the in-flight count are
//! atomics; a slot's `Frame` is moved out of its cell under a short lock
//! and moved back when the guard is finished, so no lock is held while
//! pixels are copied.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::StreamError;
use crate::pool::{TieredAllocator, lock};
use crate::stats::{DropCause, StreamStats};
use crate::types::{Frame, FrameDims};

/// Smallest and largest supported queue depth.
pub const MIN_DEPTH: usize = 2;
pub const MAX_DEPTH: usize = 3;

pub struct FrameQueue {
    slots: Box<[Mutex<Option<Frame>>]>,
    dims: FrameDims,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    count: AtomicUsize,
    sequence: AtomicU64,
    dropped: AtomicU64,
    readable: Notify,
    stats: Option<Arc<StreamStats>>,
}

impl FrameQueue {
    /// Allocate `depth` frame slots of `dims` from `allocator`.
    ///
    /// Allocation failure is resource-fatal.
    pub fn new(
        depth: usize,
        dims: FrameDims,
        allocator: &TieredAllocator,
    ) -> Result<Self, StreamError> {
        if !(MIN_DEPTH..=MAX_DEPTH).contains(&depth) {
            return Err(StreamError::InvalidConfig("frame queue depth must be 2 or 3"));
        }
        if dims.pixel_count() == 0 {
            return Err(StreamError::InvalidConfig("frame dimensions must be non-zero"));
        }

        let slots = (0..depth)
            .map(|_| {
                allocator
                    .allocate_zeroed(dims.pixel_count())
                    .map(|pixels| Mutex::new(Some(Frame::new(pixels))))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            slots: slots.into_boxed_slice(),
            dims,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            readable: Notify::new(),
            stats: None,
        })
    }

    /// Also count producer-side drops in the shared stream statistics.
    pub fn with_stats(mut self, stats: Arc<StreamStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn dims(&self) -> FrameDims {
        self.dims
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Frames submitted but not yet released by the consumer.
    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Producer requests refused because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = &self.stats {
            stats.record_drop(DropCause::ProducerQueueFull);
        }
    }

    // ── Producer side ────────────────────────────────────────────

    /// Claim the next free slot for writing, or `None` when the queue is full.
    pub fn acquire_write_slot(&self) -> Option<WriteSlot<'_>> {
        if self.count.load(Ordering::Acquire) >= self.depth() {
            self.record_drop();
            return None;
        }
        let index = self.write_idx.load(Ordering::Relaxed);
        // `None` means the previous WriteSlot is still alive.
        let Some(frame) = lock(&self.slots[index]).take() else {
            self.record_drop();
            return None;
        };
        Some(WriteSlot {
            queue: self,
            index,
            frame: Some(frame),
        })
    }

    /// Copy `pixels` into the next free slot and publish it.
    ///
    /// Returns `false` when the frame was dropped (queue full or wrong size).
    pub fn submit_frame(&self, pixels: &[u8], palette: u8) -> bool {
        if pixels.len() != self.dims.pixel_count() {
            warn!(
                "rejecting frame of {} bytes, expected {} ({})",
                pixels.len(),
                self.dims.pixel_count(),
                self.dims
            );
            return false;
        }
        let Some(mut slot) = self.acquire_write_slot() else {
            return false;
        };
        slot.pixels_mut().copy_from_slice(pixels);
        slot.set_palette(palette);
        slot.submit();
        true
    }

    // ── Consumer side ────────────────────────────────────────────

    /// The oldest submitted frame, or `None` when nothing is pending.
    pub fn next_readable(&self) -> Option<ReadSlot<'_>> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let index = self.read_idx.load(Ordering::Relaxed);
        let frame = lock(&self.slots[index]).take()?;
        Some(ReadSlot {
            queue: self,
            index,
            frame: Some(frame),
        })
    }

    /// Wait until a frame is readable or `timeout` elapses.
    pub async fn wait_readable(&self, timeout: Duration) -> bool {
        if self.in_flight() > 0 {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.readable.notified()).await;
        self.in_flight() > 0
    }

    fn put_back(&self, index: usize, frame: Frame) {
        *lock(&self.slots[index]) = Some(frame);
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("dims", &self.dims)
            .field("depth", &self.depth())
            .field("in_flight", &self.in_flight())
            .field("dropped", &self.dropped())
            .finish()
    }
}

// ── WriteSlot ────────────────────────────────────────────────────

/// Producer's exclusive handle on one slot.
///
/// Dropping it without calling [`submit`](Self::submit) returns the slot
/// unused.
pub struct WriteSlot<'q> {
    queue: &'q FrameQueue,
    index: usize,
    frame: Option<Frame>,
}

impl WriteSlot<'_> {
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        match self.frame.as_mut() {
            Some(frame) => frame.pixels_mut(),
            None => &mut [],
        }
    }

    pub fn set_palette(&mut self, palette: u8) {
        if let Some(frame) = self.frame.as_mut() {
            frame.palette = palette;
        }
    }

    /// Publish the frame to the consumer.
    pub fn submit(mut self) {
        let Some(mut frame) = self.frame.take() else {
            return;
        };
        let queue = self.queue;
        frame.sequence = queue.sequence.fetch_add(1, Ordering::Relaxed);
        frame.submitted_at = Some(Instant::now());
        queue.put_back(self.index, frame);
        queue
            .write_idx
            .store((self.index + 1) % queue.depth(), Ordering::Relaxed);
        queue.count.fetch_add(1, Ordering::Release);
        queue.readable.notify_one();
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.queue.put_back(self.index, frame);
        }
    }
}

// ── ReadSlot ─────────────────────────────────────────────────────

/// Consumer's exclusive handle on the oldest submitted frame.
///
/// The slot becomes writable again when this is released or dropped.
pub struct ReadSlot<'q> {
    queue: &'q FrameQueue,
    index: usize,
    frame: Option<Frame>,
}

impl ReadSlot<'_> {
    pub fn pixels(&self) -> &[u8] {
        self.frame.as_ref().map(Frame::pixels).unwrap_or_default()
    }

    pub fn palette(&self) -> u8 {
        self.frame.as_ref().map_or(0, |f| f.palette)
    }

    pub fn sequence(&self) -> u64 {
        self.frame.as_ref().map_or(0, |f| f.sequence)
    }

    pub fn submitted_at(&self) -> Option<Instant> {
        self.frame.as_ref().and_then(|f| f.submitted_at)
    }

    pub fn release(self) {}
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        let queue = self.queue;
        queue.put_back(self.index, frame);
        queue
            .read_idx
            .store((self.index + 1) % queue.depth(), Ordering::Relaxed);
        queue.count.fetch_sub(1, Ordering::Release);
    }
}
