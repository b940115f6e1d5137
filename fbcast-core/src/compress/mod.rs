//! Adaptive frame compression.
//!
//! [`AdaptiveCompressor`] runs every configured strategy over a frame,
//! keeps the smallest output, and uses it only if it beats the raw frame
//! by at least `min_benefit`:
//!
//! ```text
//!   frame ─┬─▶ delta (vs reference) ─▶ rle ─┐
//!          ├─▶ lz77 ────────────────────────┼─▶ smallest ─▶ <= (1 - min_benefit) * len ?
//!          └─▶ rle ─────────────────────────┘                 yes: tagged body
//!                                                             no:  raw frame
//! ```
//!
//! The strategy list is chosen at runtime; delta is only attempted when a
//! same-size reference frame is available.

pub mod delta;
pub mod lz;
pub mod rle;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::StreamError;

pub use lz::{LzMatcher, LzParams};

// ── Encoding ─────────────────────────────────────────────────────

/// Wire tag following the palette byte when compression is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Encoding {
    Raw = 0,
    DeltaRle = 1,
    Lz77 = 2,
    Rle = 3,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
            Encoding::DeltaRle => "delta-rle",
            Encoding::Lz77 => "lz77",
            Encoding::Rle => "rle",
        }
    }
}

impl TryFrom<u8> for Encoding {
    type Error = StreamError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Encoding::Raw),
            1 => Ok(Encoding::DeltaRle),
            2 => Ok(Encoding::Lz77),
            3 => Ok(Encoding::Rle),
            _ => Err(StreamError::UnknownVariant {
                type_name: "Encoding",
                value: v as u64,
            }),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Strategy & config ────────────────────────────────────────────

/// One compression path the engine may try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionStrategy {
    DeltaRle,
    Lz77,
    Rle,
}

impl CompressionStrategy {
    fn encoding(self) -> Encoding {
        match self {
            CompressionStrategy::DeltaRle => Encoding::DeltaRle,
            CompressionStrategy::Lz77 => Encoding::Lz77,
            CompressionStrategy::Rle => Encoding::Rle,
        }
    }
}

impl FromStr for CompressionStrategy {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delta-rle" | "delta" => Ok(CompressionStrategy::DeltaRle),
            "lz77" | "lz" => Ok(CompressionStrategy::Lz77),
            "rle" => Ok(CompressionStrategy::Rle),
            _ => Err(StreamError::InvalidConfig("unknown compression strategy")),
        }
    }
}

/// Compression settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionConfig {
    /// Master switch. When off the wire payload is `[palette][pixels]`.
    pub enabled: bool,
    /// Payloads shorter than this are sent raw without trying.
    pub min_size: usize,
    /// Required fractional reduction, e.g. `0.05` for 5%.
    pub min_benefit: f32,
    /// Strategies to try, in order.
    pub strategies: Vec<CompressionStrategy>,
    /// Shortest RLE run worth a token.
    pub min_run: usize,
    pub lz: LzParams,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 1024,
            min_benefit: 0.05,
            strategies: vec![
                CompressionStrategy::DeltaRle,
                CompressionStrategy::Lz77,
                CompressionStrategy::Rle,
            ],
            min_run: rle::DEFAULT_MIN_RUN,
            lz: LzParams::default(),
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if !(0.0..1.0).contains(&self.min_benefit) {
            return Err(StreamError::InvalidConfig("min_benefit must be in [0, 1)"));
        }
        if self.min_run < 2 {
            return Err(StreamError::InvalidConfig("rle min_run must be at least 2"));
        }
        self.lz.validate()
    }
}

// ── Stats ────────────────────────────────────────────────────────

/// Outcome of the most recent compression attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStats {
    pub original_size: usize,
    pub compressed_size: usize,
    /// `compressed_size / original_size`.
    pub ratio: f32,
    pub elapsed: Duration,
    /// `Raw` when no strategy paid off.
    pub algorithm: Encoding,
}

/// Result of [`AdaptiveCompressor::compress`].
#[derive(Debug, Clone, Copy)]
pub struct Compressed<'a> {
    pub encoding: Encoding,
    pub body: &'a [u8],
}

// ── AdaptiveCompressor ───────────────────────────────────────────

/// Per-frame strategy selection. Scratch buffers are reused across frames.
#[derive(Debug)]
pub struct AdaptiveCompressor {
    config: CompressionConfig,
    lz: LzMatcher,
    records: Vec<u8>,
    candidate: Vec<u8>,
    best: Vec<u8>,
    last: Option<CompressionStats>,
}

impl AdaptiveCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        let lz = LzMatcher::new(config.lz);
        Self {
            config,
            lz,
            records: Vec::new(),
            candidate: Vec::new(),
            best: Vec::new(),
            last: None,
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn last_stats(&self) -> Option<CompressionStats> {
        self.last
    }

    /// Pick the best encoding of `current`.
    ///
    /// `reference` is the last frame this client successfully received;
    /// delta is skipped without one.
    pub fn compress<'a>(&'a mut self, current: &'a [u8], reference: Option<&[u8]>) -> Compressed<'a> {
        let started = Instant::now();
        let mut best_encoding = None;

        for &strategy in &self.config.strategies {
            self.candidate.clear();
            match strategy {
                CompressionStrategy::DeltaRle => {
                    let Some(reference) = reference.filter(|r| r.len() == current.len()) else {
                        continue;
                    };
                    self.records.clear();
                    if delta::encode(reference, current, &mut self.records).is_err() {
                        continue;
                    }
                    rle::encode(&self.records, self.config.min_run, &mut self.candidate);
                }
                CompressionStrategy::Lz77 => self.lz.compress(current, &mut self.candidate),
                CompressionStrategy::Rle => {
                    rle::encode(current, self.config.min_run, &mut self.candidate)
                }
            }

            if best_encoding.is_none() || self.candidate.len() < self.best.len() {
                std::mem::swap(&mut self.best, &mut self.candidate);
                best_encoding = Some(strategy.encoding());
            }
        }

        let limit = ((1.0 - self.config.min_benefit) * current.len() as f32) as usize;
        let chosen = best_encoding.filter(|_| !current.is_empty() && self.best.len() <= limit);

        let (encoding, compressed_size) = match chosen {
            Some(encoding) => (encoding, self.best.len()),
            None => (Encoding::Raw, current.len()),
        };
        let stats = CompressionStats {
            original_size: current.len(),
            compressed_size,
            ratio: if current.is_empty() {
                1.0
            } else {
                compressed_size as f32 / current.len() as f32
            },
            elapsed: started.elapsed(),
            algorithm: encoding,
        };
        trace!(
            "compressed {} -> {} bytes with {}",
            stats.original_size, stats.compressed_size, encoding
        );
        self.last = Some(stats);

        match encoding {
            Encoding::Raw => Compressed {
                encoding,
                body: current,
            },
            _ => Compressed {
                encoding,
                body: &self.best,
            },
        }
    }
}

/// Invert any encoding. `previous` is required for `DeltaRle`.
pub fn decode(
    encoding: Encoding,
    body: &[u8],
    previous: Option<&[u8]>,
    out: &mut Vec<u8>,
) -> Result<(), StreamError> {
    out.clear();
    match encoding {
        Encoding::Raw => out.extend_from_slice(body),
        Encoding::Rle => rle::decode(body, out)?,
        Encoding::Lz77 => lz::decompress(body, out)?,
        Encoding::DeltaRle => {
            let previous = previous.ok_or(StreamError::CorruptBody {
                encoding: "delta-rle",
                reason: "no reference frame",
            })?;
            let mut records = Vec::new();
            rle::decode(body, &mut records)?;
            delta::apply(previous, &records, out)?;
        }
    }
    Ok(())
}
