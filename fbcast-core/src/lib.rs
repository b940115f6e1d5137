//! # fbcast-core
//!
//! Streaming core for pushing an 8-bit-palette framebuffer to browser
//! viewers over WebSocket.
//!
//! This crate contains:
//! - **Frame pipeline**: `FrameQueue` (bounded slots), `Broadcaster`, `FramePump`
//! - **Memory**: `BufferPool` with move-only `PooledBuf` tokens over a `TieredAllocator`
//! - **Scheduler**: one transmission worker owning the `ClientRegistry`
//! - **Compression**: delta, RLE and LZ77 behind `AdaptiveCompressor`
//! - **WebSocket**: handshake, frame codec, fragmentation, permessage-deflate
//! - **Server**: TCP acceptor and per-connection reader tasks
//! - **Input**: message reassembly, `InputSink`, `InputEvent` decoding
//! - **Error**: `StreamError`, a typed `thiserror` hierarchy

pub mod compress;
pub mod config;
pub mod error;
pub mod input;
pub mod pool;
pub mod pump;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod stats;
pub mod types;
pub mod ws;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use compress::{AdaptiveCompressor, CompressionConfig, CompressionStats, CompressionStrategy, Encoding};
pub use config::{DeflateConfig, StreamConfig};
pub use error::{HandshakeError, StreamError};
pub use input::{ChannelInputSink, DiscardInput, InboundMessage, InputEvent, InputSink, MessageKind};
pub use pool::{BufferPool, PoolStats, PooledBuf, TieredAllocator};
pub use pump::{Broadcaster, FramePump};
pub use queue::FrameQueue;
pub use registry::{Client, ClientId, ClientRegistry};
pub use scheduler::{ControlEvent, FrameKind, NetworkMessage, Scheduler, SchedulerHandle};
pub use server::StreamServer;
pub use sink::{FrameSink, SocketSink};
pub use stats::{DropCause, StatsSnapshot, StreamStats};
pub use types::FrameDims;
pub use ws::{CloseCode, ConnectionState, WsCodec, WsFrame};
