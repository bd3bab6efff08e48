//! Peer watcher - dials a peer and prints every decoded event
//!
//! Usage: cargo run --example watch_peer -- <ip:port>
//! Example: cargo run --example watch_peer -- 127.0.0.1:8333

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use rustbit_network::messages::{install_reference_codecs, Ping};
use rustbit_network::{MessageRegistry, NetworkConfig, NetworkEvent, NetworkService};

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("logging already initialized");

    let args: Vec<String> = env::args().collect();
    let addr = if args.len() > 1 {
        args[1].clone()
    } else {
        "127.0.0.1:8333".to_string()
    };
    let addr = addr.parse().expect("peer address must be ip:port");

    let registry = Arc::new(MessageRegistry::new());
    install_reference_codecs(&registry, 64);

    let config = NetworkConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..NetworkConfig::default()
    };
    let (service, mut events, handle) = NetworkService::new(config, registry);
    tokio::spawn(service.run());

    println!("Dialing {addr}...");
    handle.open(addr).await.unwrap();

    let watch = async {
        while let Some(event) = events.recv().await {
            match event {
                NetworkEvent::Connected { peer, .. } => {
                    println!("Connected to {peer}, sending ping");
                    handle.send(peer, &Ping::random()).await.unwrap();
                }
                NetworkEvent::Message { peer, header, payload } => {
                    println!("{peer} {} ({} bytes): {payload:?}", header.command, header.length);
                }
                NetworkEvent::MessageChunk { peer, sequence, done, chunk, .. } => {
                    println!("{peer} chunk #{sequence} (done={done}): {chunk:?}");
                }
                NetworkEvent::DecodeError { peer, detail } => {
                    println!("{peer} decode error: {detail}");
                }
                NetworkEvent::ConnectRejected { peer, reason } => {
                    println!("{peer} rejected: {reason:?}");
                    break;
                }
                NetworkEvent::Disconnected { peer, reason } => {
                    println!("{peer} disconnected: {reason:?}");
                    break;
                }
            }
        }
    };

    if tokio::time::timeout(Duration::from_secs(60), watch).await.is_err() {
        println!("Done watching");
    }
    handle.shutdown().await.ok();
}
