//! TCP acceptor and per-connection reader tasks.
//!
//! ```text
//! accept ─▶ handshake ─▶ split ─┬─ write half ─▶ SocketSink ─▶ Register ─▶ worker
//!                               └─ read half  ─▶ FramedRead<WsCodec> ─▶ reader loop
//! ```
//!
//! The reader never writes. Pings, closes and errors are forwarded to the
//! transmission worker as [`ControlEvent`]s; data messages are reassembled,
//! inflated if needed, and handed to the [`InputSink`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::input::{InboundMessage, InputSink, MessageAssembler, MessageKind};
use crate::registry::{Client, ClientId};
use crate::scheduler::{ControlEvent, SchedulerHandle};
use crate::sink::SocketSink;
use crate::stats::{Stage, StreamStats};
use crate::ws::handshake::{self, Handshake};
use crate::ws::{CloseCode, Deflater, Inflater, OpCode, WsCodec, WsFrame};

/// Minimum spacing of liveness events caused by inbound data.
const ACTIVITY_REPORT_INTERVAL: Duration = Duration::from_millis(250);

/// State shared by the acceptor and every connection task.
struct Shared {
    config: Arc<StreamConfig>,
    scheduler: SchedulerHandle,
    input: Arc<dyn InputSink>,
    stats: Arc<StreamStats>,
}

// ── StreamServer ─────────────────────────────────────────────────

pub struct StreamServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl StreamServer {
    pub async fn bind(
        config: Arc<StreamConfig>,
        scheduler: SchedulerHandle,
        input: Arc<dyn InputSink>,
        stats: Arc<StreamStats>,
    ) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            "listening on ws://{}{}",
            listener.local_addr()?,
            config.ws_path
        );
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                scheduler,
                input,
                stats,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), StreamError> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&self.shared);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        serve_connection(stream, peer, shared, cancel).await;
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        info!("acceptor stopped");
        Ok(())
    }
}

// ── Connection task ──────────────────────────────────────────────

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{peer}: set_nodelay failed: {e}");
    }

    let config = &shared.config;
    let accepting = shared.scheduler.client_count() < config.max_clients;
    let opts = config.handshake_options(accepting);

    let started = Instant::now();
    let upgraded = tokio::select! {
        _ = cancel.cancelled() => return,
        result = handshake::accept(&mut stream, &opts) => result,
    };
    let handshake = match upgraded {
        Ok(handshake) => handshake,
        Err(e) => {
            shared.stats.record_handshake_failure();
            info!("{peer}: upgrade refused: {e}");
            return;
        }
    };
    shared
        .stats
        .record_timing(Stage::Handshake, started.elapsed());

    let id = ClientId::next();
    let (read_half, write_half) = stream.into_split();
    let deflater = handshake
        .deflate
        .as_ref()
        .map(|_| Deflater::new(config.deflate.level));
    let client = Client::new(id, Box::new(SocketSink::new(write_half, config.send_timeout)))
        .with_peer(peer)
        .with_deflater(deflater)
        .with_connection(cancel.clone());

    debug!(
        "{id}: upgraded {peer} (agent: {})",
        handshake.request.user_agent.as_deref().unwrap_or("-")
    );
    if shared.scheduler.register(client).await.is_err() {
        debug!("{id}: scheduler gone, dropping connection");
        return;
    }

    read_loop(id, read_half, handshake, &shared, cancel).await;
    debug!("{id}: reader finished");
}

/// Per-connection inbound state.
struct Reader {
    id: ClientId,
    assembler: MessageAssembler,
    inflater: Option<Inflater>,
    inflated: Vec<u8>,
    last_activity: Instant,
}

impl Reader {
    /// Handle one data frame. Returns the message once complete.
    fn on_data(&mut self, frame: WsFrame) -> Result<Option<InboundMessage>, StreamError> {
        let Some(msg) = self.assembler.push(frame)? else {
            return Ok(None);
        };

        let payload = if msg.compressed {
            let inflater = self
                .inflater
                .as_mut()
                .ok_or(StreamError::Protocol("compressed message without deflate"))?;
            inflater.decompress(&msg.payload, &mut self.inflated)?;
            Bytes::copy_from_slice(&self.inflated)
        } else {
            msg.payload.freeze()
        };

        if msg.kind == MessageKind::Text && std::str::from_utf8(&payload).is_err() {
            return Err(StreamError::Protocol("text message is not valid UTF-8"));
        }
        Ok(Some(InboundMessage {
            kind: msg.kind,
            payload,
        }))
    }

    /// Whether enough time has passed to report liveness again.
    fn activity_due(&mut self) -> bool {
        if self.last_activity.elapsed() >= ACTIVITY_REPORT_INTERVAL {
            self.last_activity = Instant::now();
            return true;
        }
        false
    }
}

async fn read_loop(
    id: ClientId,
    read_half: OwnedReadHalf,
    handshake: Handshake,
    shared: &Shared,
    cancel: CancellationToken,
) {
    let max = shared.config.max_inbound_message;
    let codec = WsCodec::server(max).with_deflate(handshake.deflate.is_some());
    let mut frames = FramedRead::new(read_half, codec);
    frames.read_buffer_mut().extend_from_slice(&handshake.leftover);

    let mut reader = Reader {
        id,
        assembler: MessageAssembler::new(max),
        inflater: handshake.deflate.map(|params| Inflater::new(params, max)),
        inflated: Vec::new(),
        last_activity: Instant::now(),
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = frames.next() => next,
        };

        let event = match next {
            None => ControlEvent::Disconnected {
                id,
                reason: "connection closed by peer".into(),
            },
            Some(Err(StreamError::Connection(e))) => ControlEvent::Disconnected {
                id,
                reason: e.to_string(),
            },
            Some(Err(e)) => protocol_error(id, &e),
            Some(Ok(frame)) => match frame.opcode() {
                OpCode::Ping => ControlEvent::Ping {
                    id,
                    payload: frame.payload.freeze(),
                },
                OpCode::Pong => ControlEvent::Activity { id },
                OpCode::Close => match frame.close_status() {
                    Ok(code) => ControlEvent::CloseReceived { id, code },
                    Err(e) => protocol_error(id, &e),
                },
                _ => match reader.on_data(frame) {
                    Ok(Some(msg)) => {
                        shared.input.deliver(id, msg);
                        if !reader.activity_due() {
                            continue;
                        }
                        ControlEvent::Activity { id }
                    }
                    Ok(None) => continue,
                    Err(e) => protocol_error(reader.id, &e),
                },
            },
        };

        let terminal = matches!(
            event,
            ControlEvent::Disconnected { .. }
                | ControlEvent::CloseReceived { .. }
                | ControlEvent::ProtocolError { .. }
        );
        if shared.scheduler.notify(event).await.is_err() || terminal {
            return;
        }
    }
}

fn protocol_error(id: ClientId, err: &StreamError) -> ControlEvent {
    let code = CloseCode::for_error(err);
    debug!("{id}: inbound error: {err}");
    ControlEvent::ProtocolError { id, code }
}
