//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use marabu_core::params::{self, ChainParams};

/// Configuration for a node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: String,
    /// Port the TCP listener binds to.
    pub port: u16,
    /// Root directory for persistent data.
    pub data_dir: PathBuf,
    /// Peers dialed at startup, as `host:port` strings.
    pub bootstrap_peers: Vec<String>,
    /// Number of outgoing connections the dialer maintains.
    pub target_outbound: usize,
    /// How long a `getobject` request may wait for an answer.
    pub fetch_timeout: Duration,
    /// Consensus parameters.
    pub params: ChainParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marabu");

        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: params::DEFAULT_PORT,
            data_dir,
            bootstrap_peers: Vec::new(),
            target_outbound: params::DEFAULT_TARGET_OUTBOUND,
            fetch_timeout: params::FETCH_TIMEOUT,
            params: ChainParams::mainnet(),
        }
    }
}

impl NodeConfig {
    /// Path to the RocksDB directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// Socket address string for the listener.
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}
