//! Runtime configuration for the streaming core.
//!
//! The host builds one [`StreamConfig`] at startup (usually from its TOML
//! file) and hands it to the server, scheduler and queue constructors.

use std::net::SocketAddr;
use std::time::Duration;

use crate::compress::CompressionConfig;
use crate::error::StreamError;
use crate::queue;
use crate::types::FrameDims;
use crate::ws::frame::encoded_message_len;
use crate::ws::handshake::{HandshakeOptions, MAX_REQUEST_LEN};

/// Default WebSocket listening port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default fragment size for outbound messages.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

const POOL_SLACK: usize = 1024;

/// permessage-deflate settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateConfig {
    pub enabled: bool,
    /// zlib level, 0..=9.
    pub level: u32,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 1,
        }
    }
}

/// Configuration for the whole streaming pipeline.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub bind_addr: SocketAddr,
    /// Only this request path is upgraded.
    pub ws_path: String,
    pub max_clients: usize,

    pub dims: FrameDims,
    /// Frame slots between producer and pump (2 or 3).
    pub frame_queue_depth: usize,
    /// Messages between pump and worker.
    pub message_queue_depth: usize,
    /// How long `enqueue` waits on a full message queue before dropping.
    pub enqueue_wait: Duration,

    pub chunk_size: usize,
    pub compression: CompressionConfig,
    pub deflate: DeflateConfig,

    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
    /// How long a started close handshake may stay open.
    pub close_timeout: Duration,
    pub ping_interval: Duration,
    /// Evict clients silent for this long. Zero disables.
    pub idle_timeout: Duration,
    /// Interval of the worker's stats log line. Zero disables.
    pub report_interval: Duration,

    /// Pre-allocated message buffers.
    pub pool_buffers: usize,
    /// Bulk-tier budget in bytes. Zero allocates from the heap only.
    pub bulk_budget: usize,

    /// Largest inbound message accepted from a viewer.
    pub max_inbound_message: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            ws_path: "/ws".into(),
            max_clients: 4,
            dims: FrameDims::default(),
            frame_queue_depth: 2,
            message_queue_depth: 16,
            enqueue_wait: Duration::from_millis(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: CompressionConfig::default(),
            deflate: DeflateConfig::default(),
            handshake_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(15),
            report_interval: Duration::from_secs(30),
            pool_buffers: 8,
            bulk_budget: 0,
            max_inbound_message: 64 * 1024,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.max_clients == 0 {
            return Err(StreamError::InvalidConfig("max_clients must be non-zero"));
        }
        if self.dims.pixel_count() == 0 {
            return Err(StreamError::InvalidConfig("frame dimensions must be non-zero"));
        }
        if !(queue::MIN_DEPTH..=queue::MAX_DEPTH).contains(&self.frame_queue_depth) {
            return Err(StreamError::InvalidConfig("frame_queue_depth must be 2 or 3"));
        }
        if self.message_queue_depth == 0 {
            return Err(StreamError::InvalidConfig("message_queue_depth must be non-zero"));
        }
        if self.chunk_size == 0 {
            return Err(StreamError::InvalidConfig("chunk_size must be non-zero"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(StreamError::InvalidConfig("ws_path must start with '/'"));
        }
        if self.ping_interval.is_zero() {
            return Err(StreamError::InvalidConfig("ping_interval must be non-zero"));
        }
        if self.deflate.level > 9 {
            return Err(StreamError::InvalidConfig("deflate level must be 0..=9"));
        }
        self.compression.validate()
    }

    /// Size class of pooled message buffers: one framed wire message
    /// (palette byte, encoding tag, pixels and fragment headers) plus
    /// headroom for deflate expansion.
    pub fn pool_buffer_size(&self) -> usize {
        encoded_message_len(self.dims.pixel_count() + 2, self.chunk_size) + POOL_SLACK
    }

    pub fn handshake_options(&self, accepting: bool) -> HandshakeOptions {
        HandshakeOptions {
            path: self.ws_path.clone(),
            deflate: self.deflate.enabled,
            timeout: self.handshake_timeout,
            max_request_len: MAX_REQUEST_LEN,
            accepting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = StreamConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert!(cfg.pool_buffer_size() > 320 * 240 + 2);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = StreamConfig {
            frame_queue_depth: 5,
            ..StreamConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = StreamConfig {
            ws_path: "ws".into(),
            ..StreamConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = StreamConfig {
            chunk_size: 0,
            ..StreamConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn handshake_options_follow_config() {
        let cfg = StreamConfig {
            ws_path: "/stream".into(),
            ..StreamConfig::default()
        };
        let opts = cfg.handshake_options(false);
        assert_eq!(opts.path, "/stream");
        assert!(!opts.accepting);
    }
}
