//! Marabu full node binary.
//!
//! Opens the RocksDB store, dials bootstrap peers, and serves the
//! line-delimited JSON protocol on TCP.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use marabu_core::params;
use marabu_node_lib::{Node, NodeConfig};
use tracing::{error, info};

/// Marabu full node.
#[derive(Parser, Debug)]
#[command(
    name = "marabu-node",
    version,
    about = "Marabu full node with RocksDB storage and TCP gossip"
)]
struct Args {
    /// Data directory for blockchain storage
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    listen: String,

    /// Listen port
    #[arg(long, default_value_t = params::DEFAULT_PORT)]
    port: u16,

    /// Bootstrap peers as host:port (comma-separated)
    #[arg(long = "peer", value_delimiter = ',')]
    peers: Vec<String>,

    /// Number of outgoing connections to maintain
    #[arg(long, default_value_t = params::DEFAULT_TARGET_OUTBOUND)]
    target_outbound: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn into_config(self) -> (NodeConfig, String, String) {
        let default_data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marabu");

        let config = NodeConfig {
            listen_addr: self.listen,
            port: self.port,
            data_dir: self.data_dir.unwrap_or(default_data_dir),
            bootstrap_peers: self.peers,
            target_outbound: self.target_outbound,
            ..NodeConfig::default()
        };
        (config, self.log_level, self.log_format)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (config, log_level, log_format) = args.into_config();

    init_logging(&log_level, &log_format);

    info!("Marabu node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("listen: {}", config.listen_socket());
    info!("bootstrap_peers: {:?}", config.bootstrap_peers);

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data_dir: {e}");
        process::exit(1);
    }

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {e}");
            process::exit(1);
        }
    };

    if let Ok(Some(tip)) = node.chaintip() {
        info!("chaintip: height={} hash={}", tip.height, tip.hash);
    }

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C, shutting down...");
    };

    tokio::select! {
        result = node.clone().run() => {
            if let Err(e) = result {
                error!("node exited with error: {e}");
                process::exit(1);
            }
        }
        _ = shutdown => {}
    }

    info!("Marabu node shutdown complete");
}

/// Initialize tracing with the given level and output format. Pass
/// `format = "json"` for structured output; anything else is
/// human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
