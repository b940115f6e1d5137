//! Transmission scheduler.
//!
//! A single worker task owns the [`ClientRegistry`] and performs every
//! socket write. Everything else talks to it through two bounded
//! channels held by the cloneable [`SchedulerHandle`]:
//!
//! ```text
//!   pump ──NetworkMessage──▶ ┌────────────┐ ──▶ client#1 sink
//!                            │   worker   │ ──▶ client#2 sink
//!   readers ─ControlEvent──▶ └────────────┘ ──▶ ...
//! ```
//!
//! Control events (registration, close, ping) are always served before
//! queued frames. A full message queue is never waited on for longer
//! than `enqueue_wait`: past that the newest message is dropped and
//! counted as [`DropCause::QueueFull`].

mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compress::AdaptiveCompressor;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::pool::{BufferPool, PooledBuf};
use crate::registry::{Client, ClientId, ClientRegistry};
use crate::stats::{DropCause, StreamStats};
use crate::ws::CloseCode;

use worker::{TxContext, Worker, WorkerSettings};

/// Capacity of the control channel.
const CONTROL_QUEUE_DEPTH: usize = 64;

// ── Messages ─────────────────────────────────────────────────────

/// Whether a message may be delta-encoded against the client's last frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    /// Self-contained; never delta-encoded.
    Full,
    /// May be encoded relative to the previous frame.
    #[default]
    Delta,
}

/// One framebuffer queued for transmission.
#[derive(Debug)]
pub struct NetworkMessage {
    /// Palette-indexed pixels, one byte each.
    pub payload: PooledBuf,
    pub palette: u8,
    /// `None` broadcasts to every open client.
    pub target: Option<ClientId>,
    pub kind: FrameKind,
    pub sequence: u64,
    pub enqueued_at: Instant,
}

impl NetworkMessage {
    pub fn broadcast(payload: PooledBuf, palette: u8) -> Self {
        Self {
            payload,
            palette,
            target: None,
            kind: FrameKind::default(),
            sequence: 0,
            enqueued_at: Instant::now(),
        }
    }

    pub fn unicast(target: ClientId, payload: PooledBuf, palette: u8) -> Self {
        Self {
            target: Some(target),
            ..Self::broadcast(payload, palette)
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_kind(mut self, kind: FrameKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Connection events forwarded to the worker by reader tasks.
#[derive(Debug)]
pub enum ControlEvent {
    /// A freshly upgraded client.
    Register(Client),
    /// The reader hit EOF or an I/O error.
    Disconnected { id: ClientId, reason: String },
    /// The peer sent a close frame.
    CloseReceived { id: ClientId, code: Option<CloseCode> },
    /// The peer pinged; the worker answers with a pong.
    Ping { id: ClientId, payload: Bytes },
    /// Any inbound traffic (data, pong) that proves the peer is alive.
    Activity { id: ClientId },
    /// The peer violated the protocol; close with `code`.
    ProtocolError { id: ClientId, code: CloseCode },
}

// ── Scheduler ────────────────────────────────────────────────────

/// Spawns the transmission worker.
pub struct Scheduler;

impl Scheduler {
    /// Start the worker on the current runtime.
    ///
    /// The worker exits when `cancel` fires or every handle is dropped,
    /// after sending a 1001 close to each remaining client.
    pub fn spawn(
        config: &StreamConfig,
        pool: BufferPool,
        stats: Arc<StreamStats>,
        cancel: CancellationToken,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (msg_tx, msg_rx) = mpsc::channel(config.message_queue_depth.max(1));
        let (ctl_tx, ctl_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);

        let registry = ClientRegistry::new(config.max_clients);
        let clients = registry.count_handle();

        let tx = TxContext::new(
            AdaptiveCompressor::new(config.compression.clone()),
            pool,
            Arc::clone(&stats),
            config.chunk_size,
        );
        let worker = Worker::new(
            registry,
            tx,
            msg_rx,
            ctl_rx,
            Arc::clone(&stats),
            WorkerSettings::from_config(config),
            cancel.clone(),
        );
        let join = tokio::spawn(worker.run());

        let handle = SchedulerHandle {
            messages: msg_tx,
            control: ctl_tx,
            stats,
            clients,
            enqueue_wait: config.enqueue_wait,
            cancel,
        };
        (handle, join)
    }
}

// ── SchedulerHandle ──────────────────────────────────────────────

/// Cloneable front end of the worker.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    messages: mpsc::Sender<NetworkMessage>,
    control: mpsc::Sender<ControlEvent>,
    stats: Arc<StreamStats>,
    clients: Arc<AtomicUsize>,
    enqueue_wait: Duration,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Queue a message, waiting at most `enqueue_wait` for room.
    ///
    /// Returns `false` when the message was dropped.
    pub async fn enqueue(&self, msg: NetworkMessage) -> bool {
        let msg = match self.messages.try_send(msg) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(msg)) => msg,
        };
        match self.messages.send_timeout(msg, self.enqueue_wait).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(msg)) => {
                debug!("message queue full, dropping frame {}", msg.sequence);
                self.stats.record_drop(DropCause::QueueFull);
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Queue a message without waiting.
    pub fn try_enqueue(&self, msg: NetworkMessage) -> bool {
        match self.messages.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.record_drop(DropCause::QueueFull);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Hand a freshly upgraded client to the worker.
    pub async fn register(&self, client: Client) -> Result<(), StreamError> {
        self.notify(ControlEvent::Register(client)).await
    }

    pub async fn notify(&self, event: ControlEvent) -> Result<(), StreamError> {
        self.control
            .send(event)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Clients currently registered with the worker.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Ask the worker to close every client and exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.messages.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use flate2::{Decompress, FlushDecompress};

    use crate::compress::{CompressionConfig, Encoding};
    use crate::pool::TieredAllocator;
    use crate::sink::FrameSink;
    use crate::ws::Deflater;

    // ── Test sinks ───────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    impl Recorder {
        fn all(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().clone()
        }

        /// Recorded writes whose first frame has the given opcode.
        fn with_opcode(&self, opcode: u8) -> Vec<Vec<u8>> {
            self.all()
                .into_iter()
                .filter(|w| w[0] & 0x0F == opcode)
                .collect()
        }
    }

    struct RecordingSink {
        log: Recorder,
        fail_after: Option<(usize, io::ErrorKind)>,
        sent: usize,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
            self.sent += 1;
            if let Some((after, kind)) = self.fail_after {
                if self.sent > after {
                    return Err(io::Error::from(kind).into());
                }
            }
            self.log.0.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    struct StallSink;

    #[async_trait]
    impl FrameSink for StallSink {
        async fn send(&mut self, _bytes: &[u8]) -> Result<(), StreamError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    /// Every send times out before writing a byte.
    struct BlockedSink;

    #[async_trait]
    impl FrameSink for BlockedSink {
        async fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
            Err(StreamError::SendTimeout {
                written: 0,
                total: bytes.len(),
            })
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    const PIXELS: usize = 64;

    fn config() -> StreamConfig {
        StreamConfig {
            ping_interval: Duration::from_secs(3600),
            report_interval: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            ..StreamConfig::default()
        }
    }

    fn start(cfg: &StreamConfig) -> (SchedulerHandle, BufferPool) {
        let pool = BufferPool::new(4, 4096, TieredAllocator::heap()).unwrap();
        let (handle, _join) = Scheduler::spawn(
            cfg,
            pool.clone(),
            Arc::new(StreamStats::new()),
            CancellationToken::new(),
        );
        (handle, pool)
    }

    fn recording_client(log: &Recorder) -> Client {
        Client::new(
            ClientId::next(),
            Box::new(RecordingSink {
                log: log.clone(),
                fail_after: None,
                sent: 0,
            }),
        )
    }

    fn message(pool: &BufferPool, fill: u8, palette: u8) -> NetworkMessage {
        let mut buf = pool.acquire(PIXELS).unwrap();
        buf.extend_from_slice(&[fill; PIXELS]);
        NetworkMessage::broadcast(buf, palette)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    /// Palette byte of a single unfragmented binary frame with a short
    /// length field.
    fn palette_of(wire: &[u8]) -> u8 {
        wire[2]
    }

    // ── Tests ────────────────────────────────────────────────────

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let (handle, pool) = start(&config());
        let logs = [Recorder::default(), Recorder::default()];
        for log in &logs {
            handle.register(recording_client(log)).await.unwrap();
        }
        eventually(|| handle.client_count() == 2).await;

        assert!(handle.enqueue(message(&pool, 9, 3)).await);
        eventually(|| logs.iter().all(|l| l.with_opcode(0x2).len() == 1)).await;

        for log in &logs {
            let wire = &log.with_opcode(0x2)[0];
            assert_eq!(wire[0], 0x82);
            assert_eq!(wire[1] as usize, PIXELS + 1);
            assert_eq!(palette_of(wire), 3);
            assert!(wire[3..].iter().all(|&b| b == 9));
        }
        assert_eq!(handle.stats().frames_sent(), 2);
    }

    #[tokio::test]
    async fn failing_client_is_evicted_without_affecting_others() {
        let (handle, pool) = start(&config());
        let healthy = [Recorder::default(), Recorder::default()];
        let broken = Recorder::default();

        handle.register(recording_client(&healthy[0])).await.unwrap();
        handle
            .register(Client::new(
                ClientId::next(),
                Box::new(RecordingSink {
                    log: broken.clone(),
                    fail_after: Some((1, io::ErrorKind::BrokenPipe)),
                    sent: 0,
                }),
            ))
            .await
            .unwrap();
        handle.register(recording_client(&healthy[1])).await.unwrap();
        eventually(|| handle.client_count() == 3).await;

        for palette in 0..5u8 {
            assert!(handle.enqueue(message(&pool, 1, palette)).await);
        }
        eventually(|| healthy.iter().all(|l| l.with_opcode(0x2).len() == 5)).await;

        for log in &healthy {
            let order: Vec<u8> = log.with_opcode(0x2).iter().map(|w| palette_of(w)).collect();
            assert_eq!(order, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(broken.with_opcode(0x2).len(), 1);
        assert_eq!(handle.client_count(), 2);
        assert_eq!(handle.stats().snapshot().clients_evicted, 1);
    }

    #[tokio::test]
    async fn non_fatal_write_error_keeps_client() {
        let (handle, pool) = start(&config());
        let log = Recorder::default();
        handle
            .register(Client::new(
                ClientId::next(),
                Box::new(RecordingSink {
                    log: log.clone(),
                    fail_after: Some((0, io::ErrorKind::Other)),
                    sent: 0,
                }),
            ))
            .await
            .unwrap();
        eventually(|| handle.client_count() == 1).await;

        assert!(handle.enqueue(message(&pool, 1, 0)).await);
        let stats = Arc::clone(handle.stats());
        eventually(|| stats.dropped(DropCause::WriteFailure) == 1).await;
        assert_eq!(handle.client_count(), 1);
    }

    #[tokio::test]
    async fn messages_without_clients_are_counted() {
        let (handle, pool) = start(&config());
        assert!(handle.enqueue(message(&pool, 0, 0)).await);
        let stats = Arc::clone(handle.stats());
        eventually(|| stats.dropped(DropCause::NoClients) == 1).await;
        // The payload went back to the pool.
        eventually(|| pool.available() == pool.capacity()).await;
    }

    #[tokio::test]
    async fn full_queue_drops_newest_within_bounded_wait() {
        let cfg = StreamConfig {
            message_queue_depth: 2,
            enqueue_wait: Duration::from_millis(5),
            ..config()
        };
        let (handle, pool) = start(&cfg);
        handle
            .register(Client::new(ClientId::next(), Box::new(StallSink)))
            .await
            .unwrap();
        eventually(|| handle.client_count() == 1).await;

        let started = Instant::now();
        let mut rejected = 0;
        for i in 0..10u8 {
            if !handle.enqueue(message(&pool, i, 0)).await {
                rejected += 1;
            }
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(rejected >= 7, "only {rejected} dropped");
        assert_eq!(handle.stats().dropped(DropCause::QueueFull), rejected);
    }

    #[tokio::test]
    async fn unicast_only_reaches_target() {
        let (handle, pool) = start(&config());
        let a = Recorder::default();
        let b = Recorder::default();
        let client_a = recording_client(&a);
        let target = client_a.id;
        handle.register(client_a).await.unwrap();
        handle.register(recording_client(&b)).await.unwrap();
        eventually(|| handle.client_count() == 2).await;

        let mut buf = pool.acquire(PIXELS).unwrap();
        buf.extend_from_slice(&[5; PIXELS]);
        assert!(handle.enqueue(NetworkMessage::unicast(target, buf, 1)).await);
        assert!(handle.enqueue(message(&pool, 6, 2)).await);

        eventually(|| b.with_opcode(0x2).len() == 1).await;
        eventually(|| a.with_opcode(0x2).len() == 2).await;
        assert_eq!(palette_of(&b.with_opcode(0x2)[0]), 2);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (handle, _pool) = start(&config());
        let log = Recorder::default();
        let client = recording_client(&log);
        let id = client.id;
        handle.register(client).await.unwrap();

        handle
            .notify(ControlEvent::Ping {
                id,
                payload: Bytes::from_static(b"hb"),
            })
            .await
            .unwrap();
        eventually(|| !log.with_opcode(0xA).is_empty()).await;
        assert_eq!(log.with_opcode(0xA)[0], vec![0x8A, 2, b'h', b'b']);
    }

    #[tokio::test]
    async fn peer_close_is_echoed_and_client_removed() {
        let (handle, _pool) = start(&config());
        let log = Recorder::default();
        let client = recording_client(&log);
        let id = client.id;
        handle.register(client).await.unwrap();
        eventually(|| handle.client_count() == 1).await;

        handle
            .notify(ControlEvent::CloseReceived {
                id,
                code: Some(CloseCode::Normal),
            })
            .await
            .unwrap();
        eventually(|| handle.client_count() == 0).await;
        assert_eq!(log.with_opcode(0x8)[0], vec![0x88, 2, 0x03, 0xE8]);
    }

    #[tokio::test]
    async fn registration_beyond_capacity_is_refused() {
        let cfg = StreamConfig {
            max_clients: 1,
            ..config()
        };
        let (handle, _pool) = start(&cfg);
        let first = Recorder::default();
        let second = Recorder::default();
        handle.register(recording_client(&first)).await.unwrap();
        handle.register(recording_client(&second)).await.unwrap();

        eventually(|| !second.with_opcode(0x8).is_empty()).await;
        let close = &second.with_opcode(0x8)[0];
        assert_eq!(u16::from_be_bytes([close[2], close[3]]), 1013);
        assert_eq!(handle.client_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let (handle, _pool) = start(&config());
        let log = Recorder::default();
        handle.register(recording_client(&log)).await.unwrap();
        eventually(|| handle.client_count() == 1).await;

        handle.shutdown();
        eventually(|| !log.with_opcode(0x8).is_empty()).await;
        let close = &log.with_opcode(0x8)[0];
        assert_eq!(u16::from_be_bytes([close[2], close[3]]), 1001);
        eventually(|| handle.client_count() == 0).await;
    }

    #[tokio::test]
    async fn repeated_frame_is_sent_as_empty_delta() {
        let cfg = StreamConfig {
            compression: CompressionConfig {
                enabled: true,
                min_size: 16,
                ..CompressionConfig::default()
            },
            ..config()
        };
        let (handle, pool) = start(&cfg);
        let log = Recorder::default();
        handle.register(recording_client(&log)).await.unwrap();
        eventually(|| handle.client_count() == 1).await;

        assert!(handle.enqueue(message(&pool, 4, 7)).await);
        assert!(handle.enqueue(message(&pool, 4, 7)).await);
        eventually(|| log.with_opcode(0x2).len() == 2).await;

        let frames = log.with_opcode(0x2);
        assert_ne!(frames[0][3], Encoding::Raw as u8);
        assert_eq!(frames[1], vec![0x82, 2, 7, Encoding::DeltaRle as u8]);
    }

    #[tokio::test]
    async fn deflate_clients_get_rsv1_frames() {
        let (handle, pool) = start(&config());
        let log = Recorder::default();
        handle
            .register(recording_client(&log).with_deflater(Some(Deflater::new(6))))
            .await
            .unwrap();
        eventually(|| handle.client_count() == 1).await;

        assert!(handle.enqueue(message(&pool, 0, 2)).await);
        eventually(|| log.with_opcode(0x2).len() == 1).await;

        let wire = &log.with_opcode(0x2)[0];
        assert_eq!(wire[0], 0xC2);
        let len = wire[1] as usize;
        let mut body = wire[2..2 + len].to_vec();
        body.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);

        let mut inflated = Vec::with_capacity(1024);
        Decompress::new(false)
            .decompress_vec(&body, &mut inflated, FlushDecompress::Sync)
            .unwrap();
        assert_eq!(inflated[0], 2);
        assert_eq!(&inflated[1..], &[0u8; PIXELS][..]);
    }

    #[tokio::test]
    async fn repeatedly_blocked_client_is_evicted() {
        let (handle, pool) = start(&config());
        handle
            .register(Client::new(ClientId::next(), Box::new(BlockedSink)))
            .await
            .unwrap();
        eventually(|| handle.client_count() == 1).await;
        let stats = Arc::clone(handle.stats());

        for i in 1..worker::MAX_STALLED_SENDS {
            assert!(handle.enqueue(message(&pool, 0, 0)).await);
            eventually(|| stats.dropped(DropCause::WriteFailure) == u64::from(i)).await;
        }
        assert_eq!(handle.client_count(), 1);

        assert!(handle.enqueue(message(&pool, 0, 0)).await);
        eventually(|| handle.client_count() == 0).await;
        assert_eq!(stats.snapshot().clients_evicted, 1);
    }

    fn idle_config(close_timeout: Duration) -> StreamConfig {
        StreamConfig {
            ping_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(60),
            close_timeout,
            ..config()
        }
    }

    #[tokio::test]
    async fn idle_client_is_closed_and_dropped_without_echo() {
        let (handle, pool) = start(&idle_config(Duration::from_millis(300)));
        let log = Recorder::default();
        handle.register(recording_client(&log)).await.unwrap();
        eventually(|| handle.client_count() == 1).await;

        eventually(|| !log.with_opcode(0x8).is_empty()).await;
        let close = &log.with_opcode(0x8)[0];
        assert_eq!(u16::from_be_bytes([close[2], close[3]]), 1001);
        // Still registered while the close handshake is pending.
        assert_eq!(handle.client_count(), 1);

        assert!(handle.enqueue(message(&pool, 1, 0)).await);
        eventually(|| handle.client_count() == 0).await;
        assert!(log.with_opcode(0x2).is_empty());
        assert_eq!(log.with_opcode(0x8).len(), 1);
        assert_eq!(handle.stats().snapshot().clients_evicted, 1);
    }

    #[tokio::test]
    async fn close_echo_completes_a_server_close() {
        let (handle, _pool) = start(&idle_config(Duration::from_secs(3600)));
        let log = Recorder::default();
        let client = recording_client(&log);
        let id = client.id;
        handle.register(client).await.unwrap();

        eventually(|| !log.with_opcode(0x8).is_empty()).await;
        assert_eq!(handle.client_count(), 1);

        handle
            .notify(ControlEvent::CloseReceived {
                id,
                code: Some(CloseCode::GoingAway),
            })
            .await
            .unwrap();
        eventually(|| handle.client_count() == 0).await;
        // The echo is not answered again.
        assert_eq!(log.with_opcode(0x8).len(), 1);
    }
}
