//! Frame types shared between the producer, the frame queue and the pump.
//!
//! A frame is one palette index per pixel plus a palette-selector byte.
//! These are **internal** representations; the wire layout is built by
//! the scheduler (`[palette][tag?][body]`).

use std::fmt;
use std::time::Instant;

use crate::pool::TierBuf;

/// Default framebuffer width in pixels.
pub const DEFAULT_WIDTH: u32 = 320;
/// Default framebuffer height in pixels.
pub const DEFAULT_HEIGHT: u32 = 240;

// ── FrameDims ────────────────────────────────────────────────────

/// Framebuffer dimensions. One byte per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count, which is also the frame's byte length.
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for FrameDims {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

impl fmt::Display for FrameDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// One framebuffer slot. Owned by exactly one party at a time.
#[derive(Debug)]
pub struct Frame {
    pub(crate) pixels: TierBuf,
    /// Palette selector transmitted ahead of the pixels.
    pub palette: u8,
    /// Monotonic submission number, assigned by the queue.
    pub sequence: u64,
    /// When the producer submitted the frame.
    pub submitted_at: Option<Instant>,
}

impl Frame {
    pub(crate) fn new(pixels: TierBuf) -> Self {
        Self {
            pixels,
            palette: 0,
            sequence: 0,
            submitted_at: None,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.pixels.as_mut_slice()
    }
}
