//! Node configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use rustbit_network::discovery::NetworkType;
use rustbit_network::NetworkConfig;

use crate::Args;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, used in logs only.
    pub node_name: String,
    /// Network (mainnet, testnet, regtest).
    pub network: String,
    /// Static peers to dial at startup. Empty means use DNS discovery.
    #[serde(default)]
    pub peers: Vec<String>,
    /// P2P engine settings.
    #[serde(default)]
    pub p2p: P2pConfig,
}

/// P2P engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Listen address. The port defaults per network when absent.
    pub bind_address: String,
    /// Cap on established plus pending connections.
    pub max_connections: usize,
    /// Transport dial timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Pending-connect expiry, in seconds.
    pub confirm_timeout_secs: u64,
    /// Bodies at or above this many bytes stream through a worker.
    pub large_threshold: usize,
    /// Hard cap on declared body length.
    pub max_message_size: usize,
    /// Per-wait starvation timeout while streaming, in seconds.
    pub stream_read_timeout_secs: u64,
    /// Verify checksums on buffered bodies.
    pub verify_checksums: bool,
    /// Transactions per streamed block chunk.
    pub tx_batch: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        let network = NetworkConfig::default();
        Self {
            bind_address: "0.0.0.0:8333".to_string(),
            max_connections: network.max_connections,
            connect_timeout_secs: network.connect_timeout.as_secs(),
            confirm_timeout_secs: network.confirm_timeout.as_secs(),
            large_threshold: network.large_threshold,
            max_message_size: network.max_message_size,
            stream_read_timeout_secs: network.stream_read_timeout.as_secs(),
            verify_checksums: network.verify_checksums,
            tx_batch: 512,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(&args.network)
        };

        // Override with CLI args
        config.network = args.network.clone();
        if let Some(ref bind) = args.p2p_bind {
            config.p2p.bind_address = bind.clone();
        }
        if !args.peer.is_empty() {
            config.peers = args.peer.clone();
        }

        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(network: &str) -> Self {
        let bind_address = match network {
            "testnet" => "0.0.0.0:18333".to_string(),
            "regtest" => "127.0.0.1:18444".to_string(),
            _ => "0.0.0.0:8333".to_string(),
        };
        Self {
            node_name: "rustbit".to_string(),
            network: network.to_string(),
            peers: Vec::new(),
            p2p: P2pConfig {
                bind_address,
                ..P2pConfig::default()
            },
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Which chain this node talks to.
    pub fn network_type(&self) -> Result<NetworkType> {
        self.network
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Build the engine configuration from these settings.
    pub fn network_config(&self) -> Result<NetworkConfig> {
        let network_type = self.network_type()?;
        let listen_addr: SocketAddr = self
            .p2p
            .bind_address
            .parse()
            .with_context(|| format!("bad bind address '{}'", self.p2p.bind_address))?;
        Ok(NetworkConfig {
            listen_addr,
            magic: network_type.magic(),
            max_connections: self.p2p.max_connections,
            connect_timeout: Duration::from_secs(self.p2p.connect_timeout_secs),
            confirm_timeout: Duration::from_secs(self.p2p.confirm_timeout_secs),
            large_threshold: self.p2p.large_threshold,
            max_message_size: self.p2p.max_message_size,
            stream_read_timeout: Duration::from_secs(self.p2p.stream_read_timeout_secs),
            verify_checksums: self.p2p.verify_checksums,
            ..NetworkConfig::default()
        })
    }
}
