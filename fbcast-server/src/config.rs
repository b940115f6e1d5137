//! Configuration for the fbcast host service.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fbcast_core::compress::lz::{LzParams, MAX_MATCH, MAX_WINDOW};
use fbcast_core::config::DEFAULT_PORT;
use fbcast_core::queue;
use fbcast_core::{CompressionConfig, CompressionStrategy, DeflateConfig, FrameDims, StreamConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub frame: FrameConfig,
    pub compression: CompressionSection,
    pub transport: TransportConfig,
    pub timeouts: TimeoutConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
    /// Built-in test-pattern producer.
    pub demo: DemoConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
    /// Request path that is upgraded to WebSocket.
    pub ws_path: String,
    pub max_clients: usize,
}

/// Framebuffer geometry and queueing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
    /// Frame slots between producer and network (2 or 3).
    pub queue_depth: usize,
}

/// Adaptive frame compression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    pub enabled: bool,
    /// Frames smaller than this are sent raw.
    pub min_size: usize,
    /// Required reduction, as a fraction (0.05 = 5%).
    pub min_benefit: f32,
    /// Tried in order: "delta-rle", "lz77", "rle".
    pub strategies: Vec<CompressionStrategy>,
    pub rle_min_run: usize,
    pub lz_window: usize,
    pub lz_min_match: usize,
    pub lz_max_chain: usize,
}

/// WebSocket transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Fragment size for outbound messages.
    pub chunk_size: usize,
    pub message_queue_depth: usize,
    pub enqueue_wait_ms: u64,
    /// Offer permessage-deflate to clients that ask for it.
    pub deflate: bool,
    pub deflate_level: u32,
    pub max_inbound_message: usize,
}

/// All durations, in milliseconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_ms: u64,
    pub send_ms: u64,
    pub close_ms: u64,
    pub ping_interval_ms: u64,
    /// 0 disables idle eviction.
    pub idle_ms: u64,
    /// Stats log interval in seconds; 0 disables.
    pub report_interval_secs: u64,
}

/// Buffer pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub pool_buffers: usize,
    /// Bulk-tier budget in KiB; 0 uses the heap only.
    pub bulk_budget_kb: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

/// Demo producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub enabled: bool,
    pub fps: u8,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            ws_path: "/ws".into(),
            max_clients: 4,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        let dims = FrameDims::default();
        Self {
            width: dims.width,
            height: dims.height,
            queue_depth: queue::MIN_DEPTH,
        }
    }
}

impl Default for CompressionSection {
    fn default() -> Self {
        let core = CompressionConfig::default();
        Self {
            enabled: core.enabled,
            min_size: core.min_size,
            min_benefit: core.min_benefit,
            strategies: core.strategies,
            rle_min_run: core.min_run,
            lz_window: core.lz.window,
            lz_min_match: core.lz.min_match,
            lz_max_chain: core.lz.max_chain,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let core = StreamConfig::default();
        Self {
            chunk_size: core.chunk_size,
            message_queue_depth: core.message_queue_depth,
            enqueue_wait_ms: core.enqueue_wait.as_millis() as u64,
            deflate: core.deflate.enabled,
            deflate_level: core.deflate.level,
            max_inbound_message: core.max_inbound_message,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let core = StreamConfig::default();
        Self {
            handshake_ms: core.handshake_timeout.as_millis() as u64,
            send_ms: core.send_timeout.as_millis() as u64,
            close_ms: core.close_timeout.as_millis() as u64,
            ping_interval_ms: core.ping_interval.as_millis() as u64,
            idle_ms: core.idle_timeout.as_millis() as u64,
            report_interval_secs: core.report_interval.as_secs(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let core = StreamConfig::default();
        Self {
            pool_buffers: core.pool_buffers,
            bulk_budget_kb: core.bulk_budget / 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: 30,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Convert into the core's `StreamConfig`, clamping every value into
    /// its supported range.
    pub fn to_stream_config(&self) -> StreamConfig {
        let ip = self.network.bind_address.parse::<IpAddr>().unwrap_or_else(|_| {
            tracing::warn!(
                "invalid bind address {:?}; using 0.0.0.0",
                self.network.bind_address
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let ws_path = if self.network.ws_path.starts_with('/') {
            self.network.ws_path.clone()
        } else {
            format!("/{}", self.network.ws_path)
        };

        let c = &self.compression;
        let compression = CompressionConfig {
            enabled: c.enabled,
            min_size: c.min_size,
            min_benefit: c.min_benefit.clamp(0.0, 0.99),
            strategies: c.strategies.clone(),
            min_run: c.rle_min_run.clamp(2, 255),
            lz: LzParams {
                window: c.lz_window.clamp(1, MAX_WINDOW),
                min_match: c.lz_min_match.clamp(4, MAX_MATCH),
                max_chain: c.lz_max_chain.max(1),
            },
        };

        let t = &self.timeouts;
        StreamConfig {
            bind_addr: SocketAddr::new(ip, self.network.port),
            ws_path,
            max_clients: self.network.max_clients.max(1),
            dims: FrameDims::new(self.frame.width.max(1), self.frame.height.max(1)),
            frame_queue_depth: self.frame.queue_depth.clamp(queue::MIN_DEPTH, queue::MAX_DEPTH),
            message_queue_depth: self.transport.message_queue_depth.max(1),
            enqueue_wait: Duration::from_millis(self.transport.enqueue_wait_ms),
            chunk_size: self.transport.chunk_size.clamp(125, 1 << 20),
            compression,
            deflate: DeflateConfig {
                enabled: self.transport.deflate,
                level: self.transport.deflate_level.min(9),
            },
            handshake_timeout: Duration::from_millis(t.handshake_ms.max(100)),
            send_timeout: Duration::from_millis(t.send_ms.max(10)),
            close_timeout: Duration::from_millis(t.close_ms.max(10)),
            ping_interval: Duration::from_millis(t.ping_interval_ms.max(100)),
            idle_timeout: Duration::from_millis(t.idle_ms),
            report_interval: Duration::from_secs(t.report_interval_secs),
            pool_buffers: self.memory.pool_buffers.max(1),
            bulk_budget: self.memory.bulk_budget_kb * 1024,
            max_inbound_message: self.transport.max_inbound_message.max(126),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
