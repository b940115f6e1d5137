//! fbcast host entry point.
//!
//! ```text
//! fbcast-server                  Run in the foreground
//! fbcast-server --config <path>  Load a custom config TOML
//! fbcast-server --port <port>    Override the listening port
//! fbcast-server --no-demo        Do not start the test-pattern producer
//! fbcast-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fbcast_server::config::ServerConfig;
use fbcast_server::service::StreamService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "fbcast-server", about = "Stream a framebuffer to browsers over WebSocket")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "fbcast-server.toml")]
    config: PathBuf,

    /// Listening port, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Disable the built-in test-pattern producer.
    #[arg(long)]
    no_demo: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if cli.no_demo {
        config.demo.enabled = false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("fbcast-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}:{}", config.network.bind_address, config.network.port);
    info!("frame: {}x{}", config.frame.width, config.frame.height);
    info!("compression: {}", if config.compression.enabled { "on" } else { "off" });
    if config.demo.enabled {
        info!("demo producer: {} fps", config.demo.fps);
    }

    let service = StreamService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
