//! Producer-facing entry point and the queue → scheduler pump.
//!
//! The producer only ever sees a [`Broadcaster`]: submitting a frame copies
//! it into a free queue slot and returns immediately. The [`FramePump`]
//! task drains the queue, copies each frame into a pooled buffer and hands
//! it to the scheduler, releasing the slot before it awaits anything.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pool::BufferPool;
use crate::queue::FrameQueue;
use crate::scheduler::{NetworkMessage, SchedulerHandle};
use crate::types::FrameDims;

/// How long the pump sleeps on an empty queue before rechecking.
const DEFAULT_POLL: Duration = Duration::from_millis(100);

// ── Broadcaster ──────────────────────────────────────────────────

/// Cheap, cloneable producer handle.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    queue: Arc<FrameQueue>,
}

impl Broadcaster {
    pub fn new(queue: Arc<FrameQueue>) -> Self {
        Self { queue }
    }

    /// Queue one frame for every connected viewer.
    ///
    /// Never blocks. Returns `false` when the frame was dropped.
    pub fn submit_frame(&self, pixels: &[u8], palette: u8) -> bool {
        self.queue.submit_frame(pixels, palette)
    }

    pub fn dims(&self) -> FrameDims {
        self.queue.dims()
    }

    /// Frames refused because every slot was in flight.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

// ── FramePump ────────────────────────────────────────────────────

pub struct FramePump {
    queue: Arc<FrameQueue>,
    pool: BufferPool,
    scheduler: SchedulerHandle,
    poll: Duration,
}

impl FramePump {
    pub fn new(queue: Arc<FrameQueue>, pool: BufferPool, scheduler: SchedulerHandle) -> Self {
        Self {
            queue,
            pool,
            scheduler,
            poll: DEFAULT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Move frames to the scheduler until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        debug!("frame pump started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.queue.wait_readable(self.poll) => {}
            }
            while let Some(msg) = self.take_next() {
                self.scheduler.enqueue(msg).await;
            }
        }
        debug!("frame pump stopped");
    }

    /// Copy the oldest readable frame into a pooled message and free its
    /// slot.
    fn take_next(&self) -> Option<NetworkMessage> {
        loop {
            let slot = self.queue.next_readable()?;
            let pixels = slot.pixels();
            match self.pool.acquire(pixels.len()) {
                Ok(mut buf) => {
                    buf.extend_from_slice(pixels);
                    let msg = NetworkMessage::broadcast(buf, slot.palette())
                        .with_sequence(slot.sequence());
                    slot.release();
                    return Some(msg);
                }
                Err(e) => {
                    warn!("dropping frame {}: {e}", slot.sequence());
                    slot.release();
                }
            }
        }
    }
}
