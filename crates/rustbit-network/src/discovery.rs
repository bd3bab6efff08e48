//! Peer discovery via DNS seeds and fallback addresses.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{DEFAULT_PORT, MAINNET_MAGIC, REGTEST_MAGIC, TESTNET_MAGIC};

/// DNS seeds maintained by long-standing community operators.
const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be:8333",
    "dnsseed.bluematt.me:8333",
    "seed.bitcoinstats.com:8333",
    "seed.btc.petertodd.org:8333",
    "seed.bitcoin.sprovoost.nl:8333",
];

const TESTNET_DNS_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch:18333",
    "seed.tbtc.petertodd.org:18333",
];

/// Static fallbacks for when DNS is unavailable.
const MAINNET_KNOWN_PEERS: &[&str] = &["162.120.69.182:8333", "88.99.167.186:8333"];

const TESTNET_KNOWN_PEERS: &[&str] = &["144.76.28.9:18333"];

/// Which chain to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    /// Network magic for headers on this chain.
    pub fn magic(&self) -> u32 {
        match self {
            NetworkType::Mainnet => MAINNET_MAGIC,
            NetworkType::Testnet => TESTNET_MAGIC,
            NetworkType::Regtest => REGTEST_MAGIC,
        }
    }

    /// Default listen port for this chain.
    pub fn default_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => DEFAULT_PORT,
            NetworkType::Testnet => 18333,
            NetworkType::Regtest => 18444,
        }
    }

    /// DNS seeds for this chain. Regtest has none.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            NetworkType::Mainnet => MAINNET_DNS_SEEDS,
            NetworkType::Testnet => TESTNET_DNS_SEEDS,
            NetworkType::Regtest => &[],
        }
    }

    /// Fallback known peers for this chain.
    pub fn known_peers(&self) -> &'static [&'static str] {
        match self {
            NetworkType::Mainnet => MAINNET_KNOWN_PEERS,
            NetworkType::Testnet => TESTNET_KNOWN_PEERS,
            NetworkType::Regtest => &[],
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkType::Mainnet),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(format!("unknown network '{other}'")),
        }
    }
}

/// Peer discovery service.
pub struct PeerDiscovery {
    network: NetworkType,
    dns_timeout: Duration,
}

impl PeerDiscovery {
    pub fn new(network: NetworkType) -> Self {
        Self {
            network,
            dns_timeout: Duration::from_secs(10),
        }
    }

    /// Set DNS resolution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    /// Resolve all DNS seeds for the network.
    pub async fn discover_from_dns(&self) -> Vec<SocketAddr> {
        let mut peers = Vec::new();
        for seed in self.network.dns_seeds() {
            match self.resolve_seed(seed).await {
                Ok(addrs) => {
                    info!(seed = %seed, count = addrs.len(), "Resolved DNS seed");
                    peers.extend(addrs);
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Failed to resolve DNS seed");
                }
            }
        }
        peers
    }

    /// Resolve a single seed without blocking the runtime.
    async fn resolve_seed(&self, seed: &str) -> Result<Vec<SocketAddr>, std::io::Error> {
        let seed = seed.to_string();
        let result = timeout(
            self.dns_timeout,
            tokio::task::spawn_blocking(move || {
                seed.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
            }),
        )
        .await;

        match result {
            Ok(Ok(Ok(addrs))) => Ok(addrs),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(std::io::Error::other(format!("task join error: {e}"))),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "DNS resolution timed out",
            )),
        }
    }

    /// Fallback known peers that parse cleanly.
    pub fn get_known_peers(&self) -> Vec<SocketAddr> {
        self.network
            .known_peers()
            .iter()
            .filter_map(|addr| addr.parse().ok())
            .collect()
    }

    /// DNS peers, or the static fallbacks when DNS yields nothing. The
    /// result is shuffled so repeated starts spread load across peers.
    pub async fn discover_all(&self) -> Vec<SocketAddr> {
        let mut peers = self.discover_from_dns().await;
        if peers.is_empty() {
            debug!("No peers from DNS, using fallback known peers");
            peers = self.get_known_peers();
        }
        peers.sort();
        peers.dedup();
        peers.shuffle(&mut rand::thread_rng());
        info!(count = peers.len(), "Discovered peers");
        peers
    }
}

/// Parse a peer address string, filling in the network's default port.
pub fn parse_peer_address(addr: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        return Some(socket_addr);
    }
    if !addr.contains(':') {
        if let Ok(socket_addr) = format!("{addr}:{default_port}").parse::<SocketAddr>() {
            return Some(socket_addr);
        }
    }
    // Hostname form, resolved synchronously.
    addr.to_socket_addrs().ok()?.next()
}
