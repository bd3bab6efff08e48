//! Node implementation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rustbit_network::discovery::{parse_peer_address, NetworkType, PeerDiscovery};
use rustbit_network::messages::{install_reference_codecs, Ping, Pong};
use rustbit_network::{
    MessageRegistry, NetworkEvent, NetworkHandle, NetworkService,
};

use crate::config::NodeConfig;

/// How many outbound peers the node tries to keep.
const TARGET_OUTBOUND: usize = 8;

/// Give up on a peer after this many consecutive failures.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Tracks a peer the node wants to stay connected to.
#[derive(Debug, Clone)]
struct ReconnectInfo {
    attempts: u32,
    next_attempt: Instant,
}

impl ReconnectInfo {
    fn new() -> Self {
        Self {
            attempts: 0,
            next_attempt: Instant::now(),
        }
    }

    /// Exponential backoff: 5s, 10s, 20s, ..., capped at 5 minutes.
    fn backoff_duration(&self) -> Duration {
        let secs = 5u64.saturating_mul(1 << self.attempts.min(6));
        Duration::from_secs(secs.min(300))
    }

    fn mark_failed(&mut self) {
        self.attempts += 1;
        self.next_attempt = Instant::now() + self.backoff_duration();
    }

    fn can_attempt(&self) -> bool {
        Instant::now() >= self.next_attempt
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// The node: networking engine plus keepalive and reconnect policy.
pub struct Node {
    config: NodeConfig,
    handle: NetworkHandle,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    service: Option<NetworkService>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let registry = Arc::new(MessageRegistry::new());
        install_reference_codecs(&registry, config.p2p.tx_batch);

        let (service, events, handle) = NetworkService::new(config.network_config()?, registry);
        Ok(Self {
            config,
            handle,
            events,
            service: Some(service),
        })
    }

    /// Handle for issuing commands from outside the run loop.
    pub fn handle(&self) -> NetworkHandle {
        self.handle.clone()
    }

    /// Peers to dial at startup: configured statics, or DNS discovery.
    async fn initial_peers(&self) -> Result<Vec<SocketAddr>> {
        let network_type = self.config.network_type()?;
        let default_port = network_type.default_port();

        if !self.config.peers.is_empty() {
            let peers: Vec<SocketAddr> = self
                .config
                .peers
                .iter()
                .filter_map(|p| parse_peer_address(p, default_port))
                .collect();
            return Ok(peers);
        }
        if network_type == NetworkType::Regtest {
            info!("Regtest with no static peers, waiting for inbound connections");
            return Ok(Vec::new());
        }

        let discovered = PeerDiscovery::new(network_type).discover_all().await;
        Ok(discovered.into_iter().take(TARGET_OUTBOUND).collect())
    }

    /// Run until the network service stops.
    pub async fn run(mut self) -> Result<()> {
        let service = self
            .service
            .take()
            .ok_or_else(|| anyhow::anyhow!("node already running"))?;
        let mut service_task = tokio::spawn(service.run());

        let mut peers: HashMap<SocketAddr, ReconnectInfo> = HashMap::new();
        for addr in self.initial_peers().await? {
            peers.insert(addr, ReconnectInfo::new());
            self.handle.open(addr).await?;
        }
        info!(name = %self.config.node_name, dialing = peers.len(), "Node running");

        let mut retry = tokio::time::interval(Duration::from_secs(5));
        let mut status = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                maybe_event = self.events.recv() => match maybe_event {
                    Some(event) => handle_event(&self.handle, &mut peers, event).await,
                    None => break,
                },
                _ = retry.tick() => {
                    let due: Vec<SocketAddr> = peers
                        .iter()
                        .filter(|(addr, info)| {
                            info.attempts > 0
                                && info.attempts < MAX_RECONNECT_ATTEMPTS
                                && info.can_attempt()
                                && !self.handle.is_connected(**addr)
                        })
                        .map(|(addr, _)| *addr)
                        .collect();
                    for addr in due {
                        debug!(peer = %addr, "Retrying connection");
                        self.handle.open(addr).await.ok();
                    }
                }
                _ = status.tick() => {
                    info!(
                        peers = self.handle.peer_count(),
                        pending = self.handle.pending_count(),
                        "Node status"
                    );
                }
                result = &mut service_task => {
                    match result {
                        Ok(Ok(())) => info!("Network service exited"),
                        Ok(Err(e)) => warn!(error = %e, "Network service failed"),
                        Err(e) => warn!(error = %e, "Network service task panicked"),
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Ask the network service to stop.
    pub async fn shutdown(handle: &NetworkHandle) {
        handle.shutdown().await.ok();
    }
}

/// React to one network event: keepalives answered, reconnect state kept.
async fn handle_event(
    handle: &NetworkHandle,
    peers: &mut HashMap<SocketAddr, ReconnectInfo>,
    event: NetworkEvent,
) {
    match event {
        NetworkEvent::Connected { peer, outbound } => {
            if let Some(info) = peers.get_mut(&peer) {
                info.reset();
            }
            debug!(peer = %peer, outbound, "Peer connected");
        }
        NetworkEvent::Disconnected { peer, reason } => {
            if let Some(info) = peers.get_mut(&peer) {
                info.mark_failed();
                debug!(peer = %peer, reason = ?reason, attempts = info.attempts, "Tracked peer lost");
            }
        }
        NetworkEvent::ConnectRejected { peer, reason } => {
            if let Some(info) = peers.get_mut(&peer) {
                info.mark_failed();
            }
            debug!(peer = %peer, reason = ?reason, "Connect attempt failed");
        }
        NetworkEvent::Message { peer, payload, .. } => {
            if let Some(ping) = payload.as_any().downcast_ref::<Ping>() {
                debug!(peer = %peer, nonce = ping.nonce, "Answering ping");
                handle.send(peer, &Pong { nonce: ping.nonce }).await.ok();
            } else {
                debug!(peer = %peer, command = payload.command(), "Message received");
            }
        }
        NetworkEvent::MessageChunk {
            peer,
            sequence,
            done,
            ..
        } => {
            if done {
                info!(peer = %peer, chunks = sequence + 1, "Large message fully streamed");
            }
        }
        NetworkEvent::DecodeError { peer, detail } => {
            warn!(peer = %peer, detail = %detail, "Peer sent undecodable bytes");
        }
    }
}
