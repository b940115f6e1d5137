//! Stream statistics: counters, stage timings and a throughput estimate.
//!
//! One [`StreamStats`] is shared (`Arc`) by the frame queue, the pump, the
//! scheduler worker and the acceptor. Counters are lock-free atomics;
//! timings and the rolling throughput window sit behind short mutexes.
//! [`StreamStats::snapshot`] produces a serialisable [`StatsSnapshot`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::compress::CompressionStats;
use crate::pool::lock;

// ── Drop causes & stages ─────────────────────────────────────────

/// Why a frame or message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// The scheduler's message queue stayed full past the enqueue wait.
    QueueFull,
    /// A message was dequeued while no client was registered.
    NoClients,
    /// A non-fatal send error abandoned the message for one client.
    WriteFailure,
    /// The producer found every frame-queue slot in flight.
    ProducerQueueFull,
}

/// Timed pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    Compression,
    Send,
}

// ── TimingStats ──────────────────────────────────────────────────

/// min / max / avg / count for one stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl TimingStats {
    pub fn record(&mut self, elapsed: Duration) {
        if self.count == 0 || elapsed < self.min {
            self.min = elapsed;
        }
        if elapsed > self.max {
            self.max = elapsed;
        }
        self.count += 1;
        self.total += elapsed;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn avg(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }

    fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            count: self.count,
            min_us: self.min.as_micros() as u64,
            max_us: self.max.as_micros() as u64,
            avg_us: self.avg().as_micros() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct StageTimings {
    handshake: TimingStats,
    compression: TimingStats,
    send: TimingStats,
}

impl StageTimings {
    fn get_mut(&mut self, stage: Stage) -> &mut TimingStats {
        match stage {
            Stage::Handshake => &mut self.handshake,
            Stage::Compression => &mut self.compression,
            Stage::Send => &mut self.send,
        }
    }
}

// ── ThroughputEstimator ──────────────────────────────────────────

/// Rolling-window throughput estimator.
///
/// Records `(timestamp, bytes)` samples and computes the average
/// bytes/second over the most recent `window`.
#[derive(Debug)]
pub struct ThroughputEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
}

impl ThroughputEstimator {
    /// An estimator over a 1-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(128),
            window,
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Record with an explicit timestamp (useful for testing).
    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.evict(when);
    }

    /// Bytes/second over the window; zero when nothing was sent.
    pub fn bytes_per_sec(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let span = last.duration_since(*first).max(Duration::from_millis(1));
        (self.total_bytes as f64 / span.as_secs_f64()) as u64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.duration_since(ts) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total_bytes = self.total_bytes.saturating_sub(bytes);
        }
    }
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── StreamStats ──────────────────────────────────────────────────

/// Shared stream counters.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_no_clients: AtomicU64,
    dropped_write_failure: AtomicU64,
    dropped_producer: AtomicU64,
    clients_connected: AtomicUsize,
    clients_evicted: AtomicU64,
    handshakes_failed: AtomicU64,
    timings: Mutex<StageTimings>,
    throughput: Mutex<ThroughputEstimator>,
    last_compression: Mutex<Option<CompressionStats>>,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// One message delivered to one client as `bytes` wire bytes.
    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        lock(&self.throughput).record(bytes as u64);
    }

    pub fn record_drop(&self, cause: DropCause) {
        let counter = match cause {
            DropCause::QueueFull => &self.dropped_queue_full,
            DropCause::NoClients => &self.dropped_no_clients,
            DropCause::WriteFailure => &self.dropped_write_failure,
            DropCause::ProducerQueueFull => &self.dropped_producer,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timing(&self, stage: Stage, elapsed: Duration) {
        lock(&self.timings).get_mut(stage).record(elapsed);
    }

    pub fn record_compression(&self, stats: CompressionStats) {
        *lock(&self.last_compression) = Some(stats);
    }

    pub fn record_eviction(&self) {
        self.clients_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_clients_connected(&self, n: usize) {
        self.clients_connected.store(n, Ordering::Relaxed);
    }

    pub fn clients_connected(&self) -> usize {
        self.clients_connected.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, cause: DropCause) -> u64 {
        match cause {
            DropCause::QueueFull => &self.dropped_queue_full,
            DropCause::NoClients => &self.dropped_no_clients,
            DropCause::WriteFailure => &self.dropped_write_failure,
            DropCause::ProducerQueueFull => &self.dropped_producer,
        }
        .load(Ordering::Relaxed)
    }

    pub fn timing(&self, stage: Stage) -> TimingStats {
        *lock(&self.timings).get_mut(stage)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let timings = lock(&self.timings);
        StatsSnapshot {
            frames_sent: self.frames_sent(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped(DropCause::QueueFull),
            dropped_no_clients: self.dropped(DropCause::NoClients),
            dropped_write_failure: self.dropped(DropCause::WriteFailure),
            dropped_producer: self.dropped(DropCause::ProducerQueueFull),
            clients_connected: self.clients_connected(),
            clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            throughput_bps: lock(&self.throughput).bytes_per_sec(),
            handshake: timings.handshake.snapshot(),
            compression: timings.compression.snapshot(),
            send: timings.send.snapshot(),
            last_compression: lock(&self.last_compression).as_ref().map(|c| {
                CompressionSnapshot {
                    algorithm: c.algorithm.name(),
                    original_size: c.original_size,
                    compressed_size: c.compressed_size,
                    ratio: c.ratio,
                    elapsed_us: c.elapsed.as_micros() as u64,
                }
            }),
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionSnapshot {
    pub algorithm: &'static str,
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f32,
    pub elapsed_us: u64,
}

/// Point-in-time copy of every statistic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub dropped_queue_full: u64,
    pub dropped_no_clients: u64,
    pub dropped_write_failure: u64,
    pub dropped_producer: u64,
    pub clients_connected: usize,
    pub clients_evicted: u64,
    pub handshakes_failed: u64,
    pub throughput_bps: u64,
    pub handshake: TimingSnapshot,
    pub compression: TimingSnapshot,
    pub send: TimingSnapshot,
    pub last_compression: Option<CompressionSnapshot>,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
