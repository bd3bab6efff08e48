//! Network service implementation.
//!
//! A single event loop owns the listener, the command channel and the
//! periodic pending-connect sweep. Each established connection gets its own
//! task; decode results and lifecycle changes flow to the subscriber as
//! [`NetworkEvent`]s on an unbounded channel, so producers never block on a
//! slow subscriber.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Frame, MessageHeader};
use crate::connection;
use crate::decoder::DecoderConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::peer::{DisconnectReason, PeerInfo, PeerState, RejectReason};
use crate::registry::{MessageRegistry, Payload};
use crate::stream::{encode_frame, MessageStream};
use crate::{DEFAULT_PORT, MAINNET_MAGIC};

/// Network service configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Local listen address.
    pub listen_addr: SocketAddr,
    /// Network magic accepted and emitted.
    pub magic: u32,
    /// Cap on established plus pending connections.
    pub max_connections: usize,
    /// Transport-level dial timeout.
    pub connect_timeout: Duration,
    /// Age at which the sweep expires a pending connect.
    pub confirm_timeout: Duration,
    /// How often the pending table is swept.
    pub sweep_interval: Duration,
    /// Read buffer size per connection.
    pub read_buffer: usize,
    /// Outbound frame queue depth per connection.
    pub write_queue: usize,
    /// Bodies at or above this many bytes stream through a worker.
    pub large_threshold: usize,
    /// Hard cap on declared body length.
    pub max_message_size: usize,
    /// Per-wait starvation timeout while streaming a body.
    pub stream_read_timeout: Duration,
    /// Verify checksums on buffered bodies.
    pub verify_checksums: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            magic: MAINNET_MAGIC,
            max_connections: 64,
            connect_timeout: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            read_buffer: 64 * 1024,
            write_queue: 128,
            large_threshold: 2 * 1024 * 1024,
            max_message_size: 1024 * 1024 * 1024,
            stream_read_timeout: Duration::from_secs(30),
            verify_checksums: true,
        }
    }
}

impl NetworkConfig {
    pub(crate) fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            magic: self.magic,
            large_threshold: self.large_threshold,
            max_message_size: self.max_message_size,
            stream_read_timeout: self.stream_read_timeout,
            verify_checksums: self.verify_checksums,
        }
    }
}

/// Events emitted to the subscriber.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A connection was established and inserted into the table.
    Connected { peer: SocketAddr, outbound: bool },
    /// A connection left the table. Emitted exactly once per connection.
    Disconnected {
        peer: SocketAddr,
        reason: DisconnectReason,
    },
    /// A connection attempt, outbound or inbound, never became a
    /// connection.
    ConnectRejected {
        peer: SocketAddr,
        reason: RejectReason,
    },
    /// A complete small message decoded on the inline path.
    Message {
        peer: SocketAddr,
        header: MessageHeader,
        payload: Box<dyn Payload>,
    },
    /// A partial result from a streamed large message.
    MessageChunk {
        peer: SocketAddr,
        header: MessageHeader,
        chunk: Box<dyn Payload>,
        /// Position of this chunk within the message, starting at zero.
        sequence: u32,
        /// True on the final chunk.
        done: bool,
    },
    /// The decoder hit a terminal error. Emitted at most once per
    /// connection, before the matching `Disconnected`.
    DecodeError { peer: SocketAddr, detail: String },
}

/// Commands accepted by the service event loop.
#[derive(Debug)]
pub enum NetworkCommand {
    Connect {
        addr: SocketAddr,
    },
    Disconnect {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Send {
        addr: SocketAddr,
        frame: Frame,
    },
    Broadcast {
        frame: Frame,
    },
    Shutdown,
}

/// One established connection as the service tracks it.
pub(crate) struct ConnectionRecord {
    pub(crate) state: PeerState,
    pub(crate) outbound: bool,
    pub(crate) frames: mpsc::Sender<Frame>,
    pub(crate) cancel: CancellationToken,
    pub(crate) saw_bytes: Arc<AtomicBool>,
    pub(crate) since: Instant,
    pub(crate) stream: Arc<MessageStream>,
    /// Reason supplied by a local close, which wins over the reason the
    /// connection task infers at exit.
    pub(crate) close_reason: Option<DisconnectReason>,
}

/// State shared between the event loop, connection tasks and handles.
pub(crate) struct Shared {
    pub(crate) config: NetworkConfig,
    pub(crate) registry: Arc<MessageRegistry>,
    pub(crate) connections: RwLock<HashMap<SocketAddr, ConnectionRecord>>,
    pub(crate) pending: RwLock<HashMap<SocketAddr, Instant>>,
    pub(crate) bound_addr: RwLock<Option<SocketAddr>>,
    pub(crate) events: mpsc::UnboundedSender<NetworkEvent>,
}

impl Shared {
    pub(crate) fn publish(&self, event: NetworkEvent) {
        // The subscriber may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    /// Promote a confirmed transport connection to an established record
    /// and spawn its I/O task.
    pub(crate) fn admit(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, outbound: bool) {
        let (frames_tx, frames_rx) = mpsc::channel(self.config.write_queue);
        let cancel = CancellationToken::new();
        let msg_stream = MessageStream::new(
            peer,
            self.config.decoder_config(),
            Arc::clone(&self.registry),
            self.events.clone(),
            cancel.clone(),
        );
        let saw_bytes = Arc::new(AtomicBool::new(false));
        {
            let mut connections = self.connections.write();
            if connections.len() + self.pending.read().len() >= self.config.max_connections {
                let count = connections.len();
                drop(connections);
                warn!(peer = %peer, count, "Rejecting connection, at capacity");
                self.publish(NetworkEvent::ConnectRejected {
                    peer,
                    reason: RejectReason::AtCapacity,
                });
                return;
            }
            match connections.entry(peer) {
                Entry::Occupied(_) => {
                    debug!(peer = %peer, "Duplicate connection, dropping");
                    return;
                }
                Entry::Vacant(slot) => {
                    slot.insert(ConnectionRecord {
                        state: PeerState::Established,
                        outbound,
                        frames: frames_tx,
                        cancel: cancel.clone(),
                        saw_bytes: Arc::clone(&saw_bytes),
                        since: Instant::now(),
                        stream: Arc::clone(&msg_stream),
                        close_reason: None,
                    });
                }
            }
        }
        info!(peer = %peer, outbound, "Connection established");
        self.publish(NetworkEvent::Connected { peer, outbound });

        tokio::spawn(connection::run_connection(
            stream, peer, msg_stream, frames_rx, cancel, saw_bytes, self,
        ));
    }

    /// Issue an outbound dial. The pending record holds a capacity slot
    /// until the transport confirms or the sweep gives up.
    pub(crate) fn connect(self: Arc<Self>, addr: SocketAddr) {
        if self.connections.read().contains_key(&addr) {
            debug!(peer = %addr, "Already connected");
            return;
        }
        let at_capacity = {
            let connections = self.connections.read();
            let mut pending = self.pending.write();
            if pending.contains_key(&addr) {
                debug!(peer = %addr, "Connect already pending");
                return;
            }
            if connections.len() + pending.len() >= self.config.max_connections {
                true
            } else {
                pending.insert(addr, Instant::now());
                false
            }
        };
        if at_capacity {
            warn!(peer = %addr, "Connect rejected, at capacity");
            self.publish(NetworkEvent::ConnectRejected {
                peer: addr,
                reason: RejectReason::AtCapacity,
            });
            return;
        }

        info!(peer = %addr, "Dialing peer");
        let shared = self;
        tokio::spawn(async move {
            match timeout(shared.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    // A sweep may have expired the pending record already;
                    // a confirmed transport still gets promoted.
                    shared.pending.write().remove(&addr);
                    shared.admit(stream, addr, true);
                }
                Ok(Err(e)) => {
                    if shared.pending.write().remove(&addr).is_some() {
                        warn!(peer = %addr, error = %e, "Connect failed");
                        shared.publish(NetworkEvent::ConnectRejected {
                            peer: addr,
                            reason: RejectReason::Refused(e.to_string()),
                        });
                    }
                }
                Err(_) => {
                    if shared.pending.write().remove(&addr).is_some() {
                        warn!(peer = %addr, "Connect timed out");
                        shared.publish(NetworkEvent::ConnectRejected {
                            peer: addr,
                            reason: RejectReason::TimedOut,
                        });
                    }
                }
            }
        });
    }

    /// Begin teardown of an established connection. Returns false if there
    /// was nothing to close or a close is already in progress.
    pub(crate) fn close_peer(&self, addr: SocketAddr, reason: DisconnectReason) -> bool {
        self.pending.write().remove(&addr);
        let mut connections = self.connections.write();
        match connections.get_mut(&addr) {
            None => {
                debug!(peer = %addr, "Close for unknown peer ignored");
                false
            }
            Some(record) if record.state == PeerState::Closing => {
                debug!(peer = %addr, "Close already in progress");
                false
            }
            Some(record) => {
                record.state = PeerState::Closing;
                record.close_reason = Some(reason);
                record.stream.close();
                record.cancel.cancel();
                true
            }
        }
    }

    /// Remove the record and emit the single `Disconnected` event. Called
    /// by the connection task on exit; `fallback` is the reason it
    /// inferred, overridden by any locally requested one.
    pub(crate) fn finish_connection(&self, addr: SocketAddr, fallback: DisconnectReason) {
        let Some(record) = self.connections.write().remove(&addr) else {
            return;
        };
        record.stream.close();
        let reason = record.close_reason.unwrap_or(fallback);
        info!(peer = %addr, reason = ?reason, "Connection closed");
        self.publish(NetworkEvent::Disconnected { peer: addr, reason });
    }

    /// Expire pending connects older than the confirmation window.
    pub(crate) fn sweep_pending(&self) {
        let cutoff = self.config.confirm_timeout;
        let mut expired = Vec::new();
        self.pending.write().retain(|addr, started| {
            if started.elapsed() > cutoff {
                expired.push(*addr);
                false
            } else {
                true
            }
        });
        for addr in expired {
            warn!(peer = %addr, "Pending connect expired");
            self.publish(NetworkEvent::ConnectRejected {
                peer: addr,
                reason: RejectReason::TimedOut,
            });
        }
    }

    /// Tear down every connection and abandon every pending dial.
    pub(crate) fn shutdown_all(&self) {
        self.pending.write().clear();
        let records: Vec<(SocketAddr, ConnectionRecord)> =
            self.connections.write().drain().collect();
        let count = records.len();
        for (addr, record) in records {
            record.stream.close();
            record.cancel.cancel();
            self.publish(NetworkEvent::Disconnected {
                peer: addr,
                reason: DisconnectReason::Requested,
            });
        }
        info!(count, "Network service stopped");
    }

    pub(crate) fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self
            .connections
            .read()
            .iter()
            .map(|(addr, record)| PeerInfo {
                addr: *addr,
                state: record.state,
                outbound: record.outbound,
                saw_bytes: record.saw_bytes.load(Ordering::Relaxed),
                since: record.since,
            })
            .collect();
        for (addr, started) in self.pending.read().iter() {
            infos.push(PeerInfo {
                addr: *addr,
                state: PeerState::Connecting,
                outbound: true,
                saw_bytes: false,
                since: *started,
            });
        }
        infos
    }
}

/// The network service event loop.
///
/// [`NetworkService::new`] hands back the service, the event receiver and
/// a cloneable [`NetworkHandle`]; `run` consumes the service and drives it
/// until shutdown.
pub struct NetworkService {
    shared: Arc<Shared>,
    command_rx: mpsc::Receiver<NetworkCommand>,
}

impl NetworkService {
    pub fn new(
        config: NetworkConfig,
        registry: Arc<MessageRegistry>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<NetworkEvent>,
        NetworkHandle,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(256);
        let shared = Arc::new(Shared {
            config,
            registry,
            connections: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            bound_addr: RwLock::new(None),
            events: event_tx,
        });
        let handle = NetworkHandle {
            shared: Arc::clone(&shared),
            commands: command_tx,
        };
        (Self { shared, command_rx }, event_rx, handle)
    }

    /// Run until a shutdown command arrives or every handle is dropped.
    pub async fn run(mut self) -> NetworkResult<()> {
        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        let local = listener.local_addr()?;
        *self.shared.bound_addr.write() = Some(local);
        info!(addr = %local, "Network service listening");

        let mut sweep = tokio::time::interval(self.shared.config.sweep_interval);
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted inbound connection");
                        Arc::clone(&self.shared).admit(stream, peer, false);
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                command = self.command_rx.recv() => match command {
                    Some(NetworkCommand::Connect { addr }) => {
                        Arc::clone(&self.shared).connect(addr);
                    }
                    Some(NetworkCommand::Disconnect { addr, reason }) => {
                        self.shared.close_peer(addr, reason);
                    }
                    Some(NetworkCommand::Send { addr, frame }) => self.send_frame(addr, frame),
                    Some(NetworkCommand::Broadcast { frame }) => self.broadcast_frame(frame),
                    Some(NetworkCommand::Shutdown) | None => break,
                },
                _ = sweep.tick() => self.shared.sweep_pending(),
            }
        }
        self.shared.shutdown_all();
        Ok(())
    }

    /// Queue a frame on one connection's writer. Never blocks the event
    /// loop: a full write queue drops the frame.
    fn send_frame(&self, addr: SocketAddr, frame: Frame) {
        let sender = self
            .shared
            .connections
            .read()
            .get(&addr)
            .filter(|record| record.state == PeerState::Established)
            .map(|record| record.frames.clone());
        match sender {
            Some(tx) => {
                if let Err(e) = tx.try_send(frame) {
                    warn!(peer = %addr, error = %e, "Outbound frame dropped");
                }
            }
            None => warn!(peer = %addr, "Send to unknown peer dropped"),
        }
    }

    fn broadcast_frame(&self, frame: Frame) {
        let senders: Vec<(SocketAddr, mpsc::Sender<Frame>)> = self
            .shared
            .connections
            .read()
            .iter()
            .filter(|(_, record)| record.state == PeerState::Established)
            .map(|(addr, record)| (*addr, record.frames.clone()))
            .collect();
        debug!(peers = senders.len(), command = %frame.command, "Broadcasting");
        for (addr, tx) in senders {
            if let Err(e) = tx.try_send(frame.clone()) {
                warn!(peer = %addr, error = %e, "Broadcast frame dropped");
            }
        }
    }
}

/// Cloneable handle for issuing commands and reading status.
#[derive(Clone)]
pub struct NetworkHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<NetworkCommand>,
}

impl NetworkHandle {
    async fn command(&self, command: NetworkCommand) -> NetworkResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::ServiceStopped)
    }

    /// Dial a peer. Resolution arrives as a `Connected` or
    /// `ConnectRejected` event.
    pub async fn open(&self, addr: SocketAddr) -> NetworkResult<()> {
        self.command(NetworkCommand::Connect { addr }).await
    }

    /// Close a connection with the given reason. Idempotent; the single
    /// `Disconnected` event follows once teardown completes.
    pub async fn close(&self, addr: SocketAddr, reason: DisconnectReason) -> NetworkResult<()> {
        self.command(NetworkCommand::Disconnect { addr, reason })
            .await
    }

    /// Encode and queue a payload for one peer.
    pub async fn send(&self, addr: SocketAddr, payload: &dyn Payload) -> NetworkResult<()> {
        if !self.is_connected(addr) {
            return Err(NetworkError::PeerNotFound(addr));
        }
        let frame = encode_frame(&self.shared.registry, payload)?;
        self.command(NetworkCommand::Send { addr, frame }).await
    }

    /// Encode and queue a payload for every established peer.
    pub async fn broadcast(&self, payload: &dyn Payload) -> NetworkResult<()> {
        let frame = encode_frame(&self.shared.registry, payload)?;
        self.command(NetworkCommand::Broadcast { frame }).await
    }

    /// Stop the event loop and tear down all connections.
    pub async fn shutdown(&self) -> NetworkResult<()> {
        self.command(NetworkCommand::Shutdown).await
    }

    /// Address the listener actually bound, once running. Useful with an
    /// ephemeral port in `listen_addr`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.bound_addr.read()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.read().len()
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.shared
            .connections
            .read()
            .get(&addr)
            .map(|record| record.state == PeerState::Established)
            .unwrap_or(false)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.peer_infos()
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.shared.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_sane() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.magic, MAINNET_MAGIC);
        assert!(config.large_threshold < config.max_message_size);
        assert!(config.connect_timeout <= config.confirm_timeout);
    }

    #[test]
    fn test_new_service_starts_empty() {
        let (_service, _events, handle) =
            NetworkService::new(NetworkConfig::default(), Arc::new(MessageRegistry::new()));
        assert_eq!(handle.peer_count(), 0);
        assert_eq!(handle.pending_count(), 0);
        assert!(handle.local_addr().is_none());
        assert!(!handle.is_connected("127.0.0.1:8333".parse().unwrap()));
    }

    #[test]
    fn test_sweep_expires_stale_pending() {
        let config = NetworkConfig {
            confirm_timeout: Duration::from_millis(10),
            ..NetworkConfig::default()
        };
        let (service, mut events, handle) =
            NetworkService::new(config, Arc::new(MessageRegistry::new()));

        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        service
            .shared
            .pending
            .write()
            .insert(addr, Instant::now() - Duration::from_millis(50));
        assert_eq!(handle.pending_count(), 1);

        service.shared.sweep_pending();
        assert_eq!(handle.pending_count(), 0);
        match events.try_recv().unwrap() {
            NetworkEvent::ConnectRejected { peer, reason } => {
                assert_eq!(peer, addr);
                assert_eq!(reason, RejectReason::TimedOut);
            }
            other => panic!("expected timeout rejection, got {other:?}"),
        }

        // A fresh record survives the sweep.
        service.shared.pending.write().insert(addr, Instant::now());
        service.shared.sweep_pending();
        assert_eq!(handle.pending_count(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expired_dial_still_promotes_on_confirmation() {
        let config = NetworkConfig {
            confirm_timeout: Duration::from_millis(10),
            ..NetworkConfig::default()
        };
        let (service, mut events, handle) =
            NetworkService::new(config, Arc::new(MessageRegistry::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // The dial goes stale and the sweep gives up on it.
        service
            .shared
            .pending
            .write()
            .insert(addr, Instant::now() - Duration::from_millis(50));
        service.shared.sweep_pending();
        assert_eq!(handle.pending_count(), 0);
        match events.try_recv().unwrap() {
            NetworkEvent::ConnectRejected { peer, reason } => {
                assert_eq!(peer, addr);
                assert_eq!(reason, RejectReason::TimedOut);
            }
            other => panic!("expected timeout rejection, got {other:?}"),
        }

        // The transport confirms after the sweep forgot the record; the
        // slow peer is still admitted, not banned.
        let stream = TcpStream::connect(addr).await.unwrap();
        Arc::clone(&service.shared).admit(stream, addr, true);

        match events.try_recv().unwrap() {
            NetworkEvent::Connected { peer, outbound } => {
                assert_eq!(peer, addr);
                assert!(outbound);
            }
            other => panic!("expected connection, got {other:?}"),
        }
        assert_eq!(handle.peer_count(), 1);
        assert!(handle.is_connected(addr));
    }

    #[test]
    fn test_pending_dials_hold_capacity_slots() {
        let config = NetworkConfig {
            max_connections: 2,
            ..NetworkConfig::default()
        };
        let (service, mut events, handle) =
            NetworkService::new(config, Arc::new(MessageRegistry::new()));

        // Two unconfirmed dials occupy both slots.
        for port in [9001u16, 9002] {
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            service.shared.pending.write().insert(addr, Instant::now());
        }

        let addr: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        Arc::clone(&service.shared).connect(addr);

        match events.try_recv().unwrap() {
            NetworkEvent::ConnectRejected { peer, reason } => {
                assert_eq!(peer, addr);
                assert_eq!(reason, RejectReason::AtCapacity);
            }
            other => panic!("expected capacity rejection, got {other:?}"),
        }
        // The rejected dial left no pending record of its own.
        assert_eq!(handle.pending_count(), 2);
        assert!(!service.shared.pending.read().contains_key(&addr));
    }
}
