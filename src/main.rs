//! Runs a single hashgraph node over TCP.
//!
//! ```bash
//! # fresh identity, put the public key into the peers file
//! hashgraph-node keygen
//!
//! hashgraph-node --listen 127.0.0.1:1337 --peers peers.json --key <seed hex>
//! ```
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hashgraph_node::algorithm::{Ed25519Signer, Signer};
use hashgraph_node::config::Config;
use hashgraph_node::net::TcpTransport;
use hashgraph_node::node::Node;
use hashgraph_node::proxy::InmemAppProxy;
use hashgraph_node::Roster;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hashgraph-node")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Address to listen on, must match the own entry of the peers file
    #[arg(long, default_value = "127.0.0.1:1337")]
    listen: String,

    /// JSON peers file: `[{"NetAddr": ..., "PubKeyHex": ...}]`
    #[arg(long, default_value = "peers.json")]
    peers: String,

    /// Hex encoded ed25519 secret seed
    #[arg(long)]
    key: Option<String>,

    /// Time between gossip ticks
    #[arg(long, default_value = "50")]
    heartbeat_ms: u64,

    /// Timeout of a single request to a peer
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Largest lag of a peer before it is told to fast-forward
    #[arg(long, default_value = "1000")]
    sync_limit: u64,

    /// Only answer requests, never initiate gossip
    #[arg(long)]
    no_gossip: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh key pair
    Keygen,
}

fn parse_seed(key: &str) -> Result<[u8; 32], hex::FromHexError> {
    let mut seed = [0u8; 32];
    hex::decode_to_slice(key.trim_start_matches("0x"), &mut seed)?;
    Ok(seed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Some(Command::Keygen) = args.command {
        let signer = Ed25519Signer::generate();
        println!("PublicKey: 0x{}", signer.identity());
        println!("PrivateKey: {}", hex::encode(signer.seed()));
        return Ok(());
    }

    let signer = match &args.key {
        Some(key) => Ed25519Signer::from_seed(parse_seed(key)?),
        None => {
            let signer = Ed25519Signer::generate();
            info!("No key given, generated 0x{}", signer.identity());
            signer
        }
    };
    let roster = Roster::load(&args.peers)?;
    let config = Config::new()
        .with_heartbeat(Duration::from_millis(args.heartbeat_ms))
        .with_sync_timeout(Duration::from_millis(args.timeout_ms))
        .with_sync_limit(args.sync_limit);

    let transport = TcpTransport::bind(&args.listen, config.sync_timeout).await?;
    let proxy = Arc::new(InmemAppProxy::new());
    let node = Node::new(config, signer, roster, Arc::new(transport), proxy)?;
    let handle = node.start(!args.no_gossip).await?;
    info!(
        id = %node.id(),
        addr = node.local_addr(),
        gossip = !args.no_gossip,
        "Node started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    node.shutdown().await;
    if let Err(e) = handle.await {
        error!("Run loop failed: {}", e);
    }
    let stats = node.stats();
    info!(
        last_decided_round = ?stats.last_decided_round,
        consensus_events = stats.consensus_events,
        "Node stopped"
    );
    Ok(())
}
