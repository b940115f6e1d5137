//! Built-in demo producer.
//!
//! Stands in for a real renderer: draws scrolling diagonal bands with a
//! bouncing block into an 8-bit frame and submits it at a fixed rate.
//! The palette index advances every [`PALETTE_PERIOD`] frames so viewers
//! can check palette switching too.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use fbcast_core::{Broadcaster, FrameDims};

/// Frames between palette switches.
pub const PALETTE_PERIOD: u64 = 120;
/// Number of palettes cycled through.
pub const PALETTE_COUNT: u64 = 4;

const BAND_WIDTH: u32 = 8;
const BAND_COLOURS: u32 = 16;
const BLOCK: u32 = 16;
const BLOCK_COLOUR: u8 = 0xFF;

// ── TestPattern ──────────────────────────────────────────────────

/// Renders the animated test pattern into a reusable buffer.
#[derive(Debug)]
pub struct TestPattern {
    dims: FrameDims,
    pixels: Vec<u8>,
    frame: u64,
}

impl TestPattern {
    pub fn new(dims: FrameDims) -> Self {
        Self {
            dims,
            pixels: vec![0; dims.pixel_count()],
            frame: 0,
        }
    }

    /// Number of frames rendered so far.
    pub fn frame_number(&self) -> u64 {
        self.frame
    }

    /// Palette index for the frame about to be rendered.
    pub fn palette(&self) -> u8 {
        ((self.frame / PALETTE_PERIOD) % PALETTE_COUNT) as u8
    }

    /// Draw the next frame. Returns its pixels and palette index.
    pub fn render_next(&mut self) -> (&[u8], u8) {
        let palette = self.palette();
        let FrameDims { width, height } = self.dims;
        let shift = self.frame as u32;

        for (y, row) in self.pixels.chunks_exact_mut(width as usize).enumerate() {
            let y = y as u32;
            for (x, px) in row.iter_mut().enumerate() {
                let band = (x as u32).wrapping_add(y).wrapping_add(shift) / BAND_WIDTH;
                *px = (band % BAND_COLOURS) as u8;
            }
        }

        // Block bouncing left and right across the middle rows.
        let block = BLOCK.min(width).min(height);
        let span = width - block;
        let bx = if span == 0 {
            0
        } else {
            let phase = shift % (2 * span);
            if phase < span { phase } else { 2 * span - phase }
        };
        let by = (height - block) / 2;
        for y in by..by + block {
            let start = (y * width + bx) as usize;
            self.pixels[start..start + block as usize].fill(BLOCK_COLOUR);
        }

        self.frame += 1;
        (self.pixels.as_slice(), palette)
    }
}

// ── DemoProducer ─────────────────────────────────────────────────

/// Feeds a [`TestPattern`] into a [`Broadcaster`] at a fixed frame rate.
pub struct DemoProducer {
    broadcaster: Broadcaster,
    pattern: TestPattern,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl DemoProducer {
    pub fn new(broadcaster: Broadcaster, fps: u8) -> Self {
        let pattern = TestPattern::new(broadcaster.dims());
        Self {
            broadcaster,
            pattern,
            interval: Duration::from_secs_f64(1.0 / f64::from(fps.max(1))),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the producer when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Mark the producer running and start it on the current runtime.
    ///
    /// The task resolves to the number of frames rendered.
    pub fn spawn(self) -> (Arc<AtomicBool>, JoinHandle<u64>) {
        self.running.store(true, Ordering::SeqCst);
        let stop = self.stop_handle();
        (stop, tokio::spawn(self.run()))
    }

    async fn run(mut self) -> u64 {
        info!(
            "demo producer: {}x{} every {:?}",
            self.pattern.dims.width, self.pattern.dims.height, self.interval
        );

        while self.running.load(Ordering::SeqCst) {
            let loop_start = Instant::now();

            let (pixels, palette) = self.pattern.render_next();
            if !self.broadcaster.submit_frame(pixels, palette) {
                debug!("demo frame {} dropped", self.pattern.frame_number());
            }

            Self::pace(loop_start, self.interval).await;
        }

        debug!("demo producer stopped");
        self.pattern.frame_number()
    }

    /// Sleep for the remainder of the frame interval.
    async fn pace(loop_start: Instant, interval: Duration) {
        let elapsed = loop_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
