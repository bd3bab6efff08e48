//! Test harness for integration tests.
//!
//! Spins up network services on ephemeral loopback ports and provides
//! helpers for collecting events with deadlines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rustbit_network::messages::install_reference_codecs;
use rustbit_network::{
    DecoderConfig, MessageRegistry, MessageStream, NetworkConfig, NetworkEvent, NetworkHandle,
    NetworkResult, NetworkService, REGTEST_MAGIC,
};

/// How long event waits may take before a test fails.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback test configuration: ephemeral port, small streaming threshold,
/// fast pending sweeps.
pub fn test_network_config() -> NetworkConfig {
    NetworkConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        magic: REGTEST_MAGIC,
        max_connections: 16,
        connect_timeout: Duration::from_secs(2),
        confirm_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(100),
        large_threshold: 512,
        max_message_size: 4 * 1024 * 1024,
        stream_read_timeout: Duration::from_secs(2),
        ..NetworkConfig::default()
    }
}

/// Registry with the reference codecs and the given streaming batch size.
pub fn test_registry(tx_batch: usize) -> Arc<MessageRegistry> {
    let registry = Arc::new(MessageRegistry::new());
    install_reference_codecs(&registry, tx_batch);
    registry
}

/// A message stream wired to a capturing event channel, no socket involved.
pub fn offline_stream(
    config: DecoderConfig,
    registry: Arc<MessageRegistry>,
) -> (
    Arc<MessageStream>,
    mpsc::UnboundedReceiver<NetworkEvent>,
    CancellationToken,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let stream = MessageStream::new(
        "127.0.0.1:48333".parse().unwrap(),
        config,
        registry,
        tx,
        cancel.clone(),
    );
    (stream, rx, cancel)
}

/// A network service running on an ephemeral loopback port.
pub struct TestService {
    pub handle: NetworkHandle,
    pub events: mpsc::UnboundedReceiver<NetworkEvent>,
    pub addr: SocketAddr,
    pub task: JoinHandle<NetworkResult<()>>,
}

impl TestService {
    /// Start a service with the default test configuration.
    pub async fn start() -> Self {
        Self::start_with(test_network_config(), test_registry(2)).await
    }

    /// Start a service with an explicit configuration and registry.
    pub async fn start_with(config: NetworkConfig, registry: Arc<MessageRegistry>) -> Self {
        let (service, events, handle) = NetworkService::new(config, registry);
        let task = tokio::spawn(service.run());

        // The bound address is published once the listener is up.
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        let addr = loop {
            if let Some(addr) = handle.local_addr() {
                break addr;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "service never bound its listener"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        Self {
            handle,
            events,
            addr,
            task,
        }
    }

    /// Next event, failing the test if none arrives in time.
    pub async fn next_event(&mut self) -> NetworkEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Skip events until one matches, failing the test on timeout.
    pub async fn wait_for<F>(&mut self, mut want: F) -> NetworkEvent
    where
        F: FnMut(&NetworkEvent) -> bool,
    {
        loop {
            let event = self.next_event().await;
            if want(&event) {
                return event;
            }
        }
    }

    /// Collect every event published within `window`.
    pub async fn drain_events(&mut self, window: Duration) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, self.events.recv()).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) | Err(_) => break,
            }
        }
        events
    }
}

/// A raw TCP client for writing arbitrary bytes at a service.
pub struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("raw connect failed");
        Self { stream }
    }

    /// Address the service sees this client under.
    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr().expect("no local address")
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("raw write failed");
        self.stream.flush().await.expect("raw flush failed");
    }
}
