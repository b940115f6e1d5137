//! The transmission worker task.
//!
//! Per message and client the worker builds the application payload
//!
//! ```text
//! compression off:  [palette][pixels ...]
//! compression on:   [palette][encoding tag][body ...]
//! ```
//!
//! optionally deflates it (permessage-deflate), fragments it into a pooled
//! wire buffer and writes it through the client's sink. A disconnect-class
//! error evicts the client; any other error only abandons this message for
//! this client. A client whose sends keep timing out without writing
//! anything is evicted after [`MAX_STALLED_SENDS`] in a row.
//!
//! Idle clients get a close frame and stay registered, receiving nothing,
//! until they echo it or `close_timeout` passes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::compress::{AdaptiveCompressor, Encoding};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::pool::BufferPool;
use crate::registry::{Client, ClientId, ClientRegistry};
use crate::scheduler::{ControlEvent, FrameKind, NetworkMessage};
use crate::stats::{DropCause, Stage, StreamStats};
use crate::ws::frame::encoded_message_len;
use crate::ws::{CloseCode, OpCode, WsFrame, encode_message};

/// Consecutive sends that time out without writing a byte before the
/// client is evicted.
pub(crate) const MAX_STALLED_SENDS: u32 = 3;

/// Timing knobs copied out of [`StreamConfig`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub close_timeout: Duration,
    pub report_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
            close_timeout: config.close_timeout,
            report_interval: config.report_interval,
        }
    }
}

// ── TxContext ────────────────────────────────────────────────────

/// Everything a single transmission needs besides the client.
pub(crate) struct TxContext {
    engine: AdaptiveCompressor,
    pool: BufferPool,
    stats: Arc<StreamStats>,
    chunk_size: usize,
    payload: Vec<u8>,
    deflated: Vec<u8>,
}

impl TxContext {
    pub fn new(
        engine: AdaptiveCompressor,
        pool: BufferPool,
        stats: Arc<StreamStats>,
        chunk_size: usize,
    ) -> Self {
        Self {
            engine,
            pool,
            stats,
            chunk_size,
            payload: Vec::new(),
            deflated: Vec::new(),
        }
    }

    fn compression_enabled(&self) -> bool {
        self.engine.config().enabled
    }

    /// Fill `self.payload` with the application payload for `client`.
    fn build_payload(&mut self, client: &Client, msg: &NetworkMessage) {
        let pixels: &[u8] = &msg.payload;
        self.payload.clear();
        self.payload.push(msg.palette);

        if !self.compression_enabled() {
            self.payload.extend_from_slice(pixels);
            return;
        }

        if pixels.len() < self.engine.config().min_size {
            self.payload.push(Encoding::Raw as u8);
            self.payload.extend_from_slice(pixels);
            return;
        }

        let reference = match msg.kind {
            FrameKind::Delta => client.reference.as_deref(),
            FrameKind::Full => None,
        };
        let started = Instant::now();
        let out = self.engine.compress(pixels, reference);
        self.payload.push(out.encoding as u8);
        self.payload.extend_from_slice(out.body);
        self.stats.record_timing(Stage::Compression, started.elapsed());
        if let Some(stats) = self.engine.last_stats() {
            self.stats.record_compression(stats);
        }
    }
}

/// Encode and send one message to one client. Returns the wire size.
async fn transmit(
    tx: &mut TxContext,
    client: &mut Client,
    msg: &NetworkMessage,
) -> Result<usize, StreamError> {
    tx.build_payload(client, msg);

    let (body, compressed) = match client.deflater.as_mut() {
        Some(deflater) => {
            deflater.compress(&tx.payload, &mut tx.deflated)?;
            (&tx.deflated[..], true)
        }
        None => (&tx.payload[..], false),
    };

    let mut wire = tx.pool.acquire(encoded_message_len(body.len(), tx.chunk_size))?;
    let fragments = encode_message(OpCode::Binary, body, tx.chunk_size, compressed, wire.vec_mut());

    let started = Instant::now();
    client.sink.send(&wire).await?;
    tx.stats.record_timing(Stage::Send, started.elapsed());

    if tx.compression_enabled() {
        let reference = client.reference.get_or_insert_with(Vec::new);
        reference.clear();
        reference.extend_from_slice(&msg.payload);
    }
    client.frames_sent += 1;
    client.bytes_sent += wire.len() as u64;

    trace!(
        "{}: frame {} sent, {} bytes in {fragments} fragment(s)",
        client.id,
        msg.sequence,
        wire.len()
    );
    Ok(wire.len())
}

/// Write a single control frame, bypassing the pool.
async fn send_control(client: &mut Client, frame: &WsFrame) -> Result<(), StreamError> {
    let mut wire = Vec::with_capacity(frame.header.encoded_len() + frame.payload.len());
    frame.write_to(&mut wire);
    client.sink.send(&wire).await
}

// ── Worker ───────────────────────────────────────────────────────

pub(crate) struct Worker {
    registry: ClientRegistry,
    tx: TxContext,
    messages: mpsc::Receiver<NetworkMessage>,
    control: mpsc::Receiver<ControlEvent>,
    stats: Arc<StreamStats>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    /// Scratch list of ids, reused per dispatch.
    targets: Vec<ClientId>,
}

impl Worker {
    pub fn new(
        registry: ClientRegistry,
        tx: TxContext,
        messages: mpsc::Receiver<NetworkMessage>,
        control: mpsc::Receiver<ControlEvent>,
        stats: Arc<StreamStats>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            tx,
            messages,
            control,
            stats,
            settings,
            cancel,
            targets: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;

        let reporting = !self.settings.report_interval.is_zero();
        let mut report = tokio::time::interval(if reporting {
            self.settings.report_interval
        } else {
            Duration::from_secs(3600)
        });
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);
        report.tick().await;

        debug!("transmission worker started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.control.recv() => self.handle_control(event).await,
                msg = self.messages.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break,
                },
                _ = ping.tick() => self.housekeeping().await,
                _ = report.tick(), if reporting => self.report(),
            }
        }

        self.close_all(CloseCode::GoingAway, "server shutting down").await;
        debug!("transmission worker stopped");
    }

    // ── Frames ───────────────────────────────────────────────────

    async fn dispatch(&mut self, msg: NetworkMessage) {
        if self.registry.is_empty() {
            trace!("no clients, dropping frame {}", msg.sequence);
            self.stats.record_drop(DropCause::NoClients);
            return;
        }

        let mut targets = std::mem::take(&mut self.targets);
        targets.clear();
        match msg.target {
            Some(id) if self.registry.contains(id) => targets.push(id),
            Some(id) => {
                debug!("{id} is gone, dropping frame {}", msg.sequence);
                self.stats.record_drop(DropCause::NoClients);
            }
            None => self.registry.ids_into(&mut targets),
        }

        for &id in &targets {
            let Some(client) = self.registry.get_mut(id) else {
                continue;
            };
            if !client.state.is_open() {
                continue;
            }
            match transmit(&mut self.tx, client, &msg).await {
                Ok(bytes) => {
                    client.stalled_sends = 0;
                    self.stats.record_sent(bytes);
                }
                Err(e) if e.is_disconnect() => self.evict(id, &e).await,
                Err(e @ StreamError::SendTimeout { written: 0, .. }) => {
                    client.stalled_sends += 1;
                    self.stats.record_drop(DropCause::WriteFailure);
                    if client.stalled_sends >= MAX_STALLED_SENDS {
                        self.evict(id, &e).await;
                    } else {
                        debug!("{id}: frame {} skipped: {e}", msg.sequence);
                    }
                }
                Err(e) => {
                    warn!("{id}: frame {} abandoned: {e}", msg.sequence);
                    self.stats.record_drop(DropCause::WriteFailure);
                }
            }
        }
        self.targets = targets;
    }

    // ── Control ──────────────────────────────────────────────────

    async fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Register(client) => self.register(client).await,
            ControlEvent::Disconnected { id, reason } => {
                if let Some(mut client) = self.registry.remove(id) {
                    client.teardown().await;
                    self.stats.set_clients_connected(self.registry.len());
                    info!("{id} disconnected: {reason}");
                }
            }
            ControlEvent::CloseReceived { id, code } => self.on_peer_close(id, code).await,
            ControlEvent::Ping { id, payload } => {
                let Some(client) = self.registry.get_mut(id) else {
                    return;
                };
                client.touch();
                if !client.state.is_open() {
                    return;
                }
                if let Err(e) = send_control(client, &WsFrame::pong(&payload)).await {
                    if e.is_disconnect() {
                        self.evict(id, &e).await;
                    }
                }
            }
            ControlEvent::Activity { id } => {
                if let Some(client) = self.registry.get_mut(id) {
                    client.touch();
                }
            }
            ControlEvent::ProtocolError { id, code } => {
                warn!("{id}: protocol error, closing with {}", code.as_u16());
                self.close_and_remove(id, code, "protocol error").await;
            }
        }
    }

    async fn register(&mut self, mut client: Client) {
        let id = client.id;
        let peer = client.peer;
        if let Err(e) = client.state.open() {
            warn!("{id} not registered: {e}");
            client.teardown().await;
            return;
        }
        match self.registry.insert(client) {
            Ok(()) => {
                self.stats.set_clients_connected(self.registry.len());
                info!(
                    "{id} registered from {} ({} connected)",
                    peer.map_or_else(|| "?".to_string(), |p| p.to_string()),
                    self.registry.len()
                );
            }
            Err(mut rejected) => {
                warn!("{id} refused: {} clients already connected", self.registry.len());
                let close = WsFrame::close(CloseCode::TryAgainLater, "server full");
                let _ = send_control(&mut rejected, &close).await;
                rejected.teardown().await;
            }
        }
    }

    /// Answer a peer's close frame, or complete one we started.
    async fn on_peer_close(&mut self, id: ClientId, code: Option<CloseCode>) {
        let Some(client) = self.registry.get_mut(id) else {
            return;
        };
        let echoed = !client.state.is_open();
        if !echoed {
            let echo = WsFrame::close(code.unwrap_or(CloseCode::Normal), "");
            let _ = send_control(client, &echo).await;
            let _ = client.state.begin_close(false);
        }
        let _ = client.state.finish_close();

        if let Some(mut client) = self.registry.remove(id) {
            client.teardown().await;
        }
        self.stats.set_clients_connected(self.registry.len());
        let code = code.map_or(0, CloseCode::as_u16);
        if echoed {
            debug!("{id} acknowledged our close ({code})");
        } else {
            info!("{id} closed by peer ({code})");
        }
    }

    /// Send a close frame and drop the client straight away.
    async fn close_and_remove(&mut self, id: ClientId, code: CloseCode, reason: &str) {
        let Some(mut client) = self.registry.remove(id) else {
            return;
        };
        if client.state.is_open() {
            let _ = send_control(&mut client, &WsFrame::close(code, reason)).await;
        }
        client.teardown().await;
        self.stats.set_clients_connected(self.registry.len());
    }

    /// Send a close frame and wait for the peer's echo.
    ///
    /// The client stays registered but receives nothing more. It is
    /// dropped when the echo arrives or `close_timeout` runs out.
    async fn start_close(&mut self, id: ClientId, code: CloseCode, reason: &str) {
        let Some(client) = self.registry.get_mut(id) else {
            return;
        };
        if !client.state.is_open() {
            return;
        }
        match send_control(client, &WsFrame::close(code, reason)).await {
            Ok(()) => {
                let _ = client.state.begin_close(true);
                debug!("{id}: closing ({}), waiting for echo", code.as_u16());
            }
            Err(e) => {
                debug!("{id}: close frame not sent: {e}");
                if let Some(mut client) = self.registry.remove(id) {
                    client.teardown().await;
                }
                self.stats.set_clients_connected(self.registry.len());
            }
        }
    }

    async fn evict(&mut self, id: ClientId, cause: &StreamError) {
        if let Some(mut client) = self.registry.remove(id) {
            client.teardown().await;
            self.stats.record_eviction();
            self.stats.set_clients_connected(self.registry.len());
            warn!(
                "{id} evicted after {} frames: {cause}",
                client.frames_sent
            );
        }
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Ping open clients, expire stale closes and close idle peers.
    async fn housekeeping(&mut self) {
        let now = Instant::now();
        let ping = WsFrame::ping(&[]);
        let idle_timeout = self.settings.idle_timeout;

        let mut targets = std::mem::take(&mut self.targets);
        targets.clear();
        self.registry.ids_into(&mut targets);

        for &id in &targets {
            let Some(client) = self.registry.get_mut(id) else {
                continue;
            };
            if client.state.close_expired(self.settings.close_timeout) {
                debug!("{id}: no close echo within {:?}", self.settings.close_timeout);
                if let Some(mut client) = self.registry.remove(id) {
                    client.teardown().await;
                }
                self.stats.set_clients_connected(self.registry.len());
                continue;
            }
            if !client.state.is_open() {
                continue;
            }
            if !idle_timeout.is_zero() && now.duration_since(client.last_activity) > idle_timeout {
                warn!("{id}: silent for {idle_timeout:?}, closing");
                self.stats.record_eviction();
                self.start_close(id, CloseCode::GoingAway, "idle timeout").await;
                continue;
            }
            if let Err(e) = send_control(client, &ping).await {
                if e.is_disconnect() {
                    self.evict(id, &e).await;
                } else {
                    debug!("{id}: ping failed: {e}");
                }
            }
        }
        self.targets = targets;
    }

    fn report(&self) {
        let snap = self.stats.snapshot();
        info!(
            "stream: {} clients, {} frames / {} bytes sent, {} B/s, dropped {} queue / {} idle / {} write, {} evicted",
            snap.clients_connected,
            snap.frames_sent,
            snap.bytes_sent,
            snap.throughput_bps,
            snap.dropped_queue_full,
            snap.dropped_no_clients,
            snap.dropped_write_failure,
            snap.clients_evicted
        );
    }

    async fn close_all(&mut self, code: CloseCode, reason: &str) {
        let close = WsFrame::close(code, reason);
        let clients = self.registry.drain();
        let count = clients.len();
        for mut client in clients {
            if client.state.is_open() {
                let _ = send_control(&mut client, &close).await;
            }
            client.teardown().await;
        }
        self.stats.set_clients_connected(0);
        if count > 0 {
            info!("closed {count} client(s): {reason}");
        }
    }
}
