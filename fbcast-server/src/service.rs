//! Stream service wiring.
//!
//! Builds the whole pipeline from a [`ServerConfig`] and runs it until
//! stopped:
//!
//! ```text
//! DemoProducer ─▶ Broadcaster ─▶ FrameQueue ─▶ FramePump ─▶ Scheduler ─▶ viewers
//!                                                              ▲
//!                              StreamServer (accept, upgrade) ─┘ ─▶ LoggingInputSink
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fbcast_core::{
    Broadcaster, BufferPool, ClientId, FramePump, FrameQueue, InboundMessage, InputEvent,
    InputSink, MessageKind, Scheduler, StreamConfig, StreamError, StreamServer, StreamStats,
    TieredAllocator,
};

use crate::config::ServerConfig;
use crate::pattern::DemoProducer;

// ── LoggingInputSink ─────────────────────────────────────────────

/// Decodes viewer input and logs it. Nothing is injected anywhere.
#[derive(Debug, Default)]
pub struct LoggingInputSink {
    events: AtomicU64,
    rejected: AtomicU64,
}

impl LoggingInputSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input events decoded so far.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Messages that were not valid input events.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl InputSink for LoggingInputSink {
    fn deliver(&self, client: ClientId, msg: InboundMessage) {
        match msg.kind {
            MessageKind::Text => {
                debug!("{client}: text message ({} bytes)", msg.payload.len());
            }
            MessageKind::Binary => match InputEvent::decode(&msg.payload) {
                Ok(event) => {
                    self.events.fetch_add(1, Ordering::Relaxed);
                    debug!("{client}: {event:?}");
                }
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!("{client}: ignoring input: {e}");
                }
            },
        }
    }
}

// ── StreamService ────────────────────────────────────────────────

/// The top-level host service.
pub struct StreamService {
    config: ServerConfig,
    cancel: CancellationToken,
}

impl StreamService {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run until stopped, then shut every task down.
    pub async fn run(&self) -> Result<(), StreamError> {
        let running = self.start().await?;
        self.cancel.cancelled().await;
        running.shutdown().await;
        Ok(())
    }

    /// Build the pipeline and spawn its tasks.
    ///
    /// 1. Allocates the buffer pool and frame queue from one allocator.
    /// 2. Spawns the scheduler worker and the frame pump.
    /// 3. Binds the WebSocket listener.
    /// 4. Starts the demo producer if enabled.
    pub async fn start(&self) -> Result<RunningService, StreamError> {
        let config = Arc::new(self.config.to_stream_config());
        config.validate()?;

        let stats = Arc::new(StreamStats::new());
        let allocator = TieredAllocator::bulk_then_heap(config.bulk_budget);
        let pool = BufferPool::new(
            config.pool_buffers,
            config.pool_buffer_size(),
            allocator.clone(),
        )?;
        let queue = Arc::new(
            FrameQueue::new(config.frame_queue_depth, config.dims, &allocator)?
                .with_stats(Arc::clone(&stats)),
        );
        if allocator.is_degraded() {
            warn!("bulk memory budget exhausted at startup; using the heap");
        }

        // Child token: the service token stays usable for `run`.
        let cancel = self.cancel.child_token();
        let (scheduler, worker) =
            Scheduler::spawn(&config, pool.clone(), Arc::clone(&stats), cancel.clone());

        let input = Arc::new(LoggingInputSink::new());
        let server = StreamServer::bind(
            Arc::clone(&config),
            scheduler.clone(),
            Arc::clone(&input) as Arc<dyn InputSink>,
            Arc::clone(&stats),
        )
        .await?;
        let local_addr = server.local_addr()?;

        let acceptor = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(e) = server.run(cancel).await {
                    error!("acceptor failed: {e}");
                }
            }
        });
        let pump = tokio::spawn(FramePump::new(Arc::clone(&queue), pool, scheduler).run(cancel.clone()));

        let broadcaster = Broadcaster::new(queue);
        let demo = if self.config.demo.enabled {
            Some(DemoProducer::new(broadcaster.clone(), self.config.demo.fps).spawn())
        } else {
            None
        };

        info!("streaming {} frames to at most {} viewers", config.dims, config.max_clients);
        Ok(RunningService {
            local_addr,
            broadcaster,
            stats,
            input,
            cancel,
            demo,
            tasks: vec![("acceptor", acceptor), ("pump", pump), ("scheduler", worker)],
        })
    }
}

// ── RunningService ───────────────────────────────────────────────

/// Handles to a started pipeline.
pub struct RunningService {
    local_addr: SocketAddr,
    broadcaster: Broadcaster,
    stats: Arc<StreamStats>,
    input: Arc<LoggingInputSink>,
    cancel: CancellationToken,
    demo: Option<(Arc<AtomicBool>, JoinHandle<u64>)>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Producer handle for callers supplying their own frames.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    pub fn input(&self) -> &LoggingInputSink {
        &self.input
    }

    /// Stop the producer, cancel every task and wait for them.
    pub async fn shutdown(self) {
        if let Some((stop, task)) = self.demo {
            stop.store(false, Ordering::SeqCst);
            match task.await {
                Ok(frames) => debug!("demo producer rendered {frames} frames"),
                Err(e) => warn!("demo producer task failed: {e}"),
            }
        }

        self.cancel.cancel();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("{name} task failed: {e}");
            }
        }

        match self.stats.snapshot().to_json() {
            Ok(json) => info!("final stats: {json}"),
            Err(e) => warn!("could not serialise stats: {e}"),
        }
        info!("stream service stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────
