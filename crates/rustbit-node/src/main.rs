//! rustbit node - a Bitcoin-style peer-to-peer node.
//!
//! This is the main entry point for the rustbit-node binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Bitcoin-style peer-to-peer node.
#[derive(Parser, Debug)]
#[command(name = "rustbit-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "rustbit.toml")]
    config: PathBuf,

    /// Network to connect to (mainnet, testnet, regtest)
    #[arg(short, long, default_value = "mainnet")]
    network: String,

    /// P2P bind address
    #[arg(long)]
    p2p_bind: Option<String>,

    /// Peer to connect to (may be given multiple times)
    #[arg(long)]
    peer: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print version and exit
    #[arg(long)]
    version_info: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version_info {
        print_version();
        return Ok(());
    }

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting rustbit node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = NodeConfig::load(&args.config, &args)?;

    info!("Network: {}", config.network);
    info!("P2P: {}", config.p2p.bind_address);

    // Create the node
    let node = Node::new(config)?;

    // Handle shutdown signals
    let handle = node.handle();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        Node::shutdown(&handle).await;
    };

    // Run the node until shutdown
    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown complete");
        }
    }

    info!("rustbit node stopped");

    Ok(())
}

fn print_version() {
    println!("rustbit node");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Protocol: {}", rustbit_network::PROTOCOL_VERSION);
    println!();
    println!("Built with:");
    println!("  SHA-256 message framing");
    println!("  Streaming block decoder");
    println!("  Tokio for async runtime");
}
