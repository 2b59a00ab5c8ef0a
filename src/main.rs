//! DHT node binary.
//!
//! Starts a node with a random identity, serves inbound connections over TCP
//! and pins ADD_FILE content into an in-memory pin set.
//!
//! # Usage
//!
//! ```bash
//! tiered-dht --listen 127.0.0.1:4100 \
//!     --peer <64 hex chars>@127.0.0.1:4101 \
//!     --super-peer <64 hex chars>
//! ```
//!
//! Logging follows `RUST_LOG` and defaults to `info`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tiered_dht::{
    derive_node_id, serve, Contact, DhtConfig, DhtNode, MemoryPeerDirectory, NodeId,
    StaticSuperPeers, TcpTransport,
};

fn parse_node_id(hex_id: &str) -> Result<NodeId> {
    let bytes = hex::decode(hex_id).context("invalid hex node id")?;
    let Ok(id) = NodeId::try_from(bytes.as_slice()) else {
        bail!("node id must be 64 hex characters (32 bytes)");
    };
    Ok(id)
}

/// A known peer given on the command line as `ID@ADDR`.
#[derive(Clone, Debug)]
struct BootstrapPeer {
    id: NodeId,
    addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, addr_part) = s
            .split_once('@')
            .context("peer must be given as ID@ADDR")?;
        let id = parse_node_id(id_part)?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        Ok(BootstrapPeer { id, addr })
    }
}

#[derive(Clone, Debug)]
struct SuperPeerId(NodeId);

impl FromStr for SuperPeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_node_id(s).map(SuperPeerId)
    }
}

#[derive(Parser, Debug)]
#[command(name = "tiered-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:4100")]
    listen: SocketAddr,

    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long = "peer", value_name = "ID@ADDR")]
    peers: Vec<BootstrapPeer>,

    /// Super peer used for ADD_FILE broadcasts. Repeatable.
    #[arg(short, long = "super-peer", value_name = "ID")]
    super_peers: Vec<SuperPeerId>,

    #[arg(long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => DhtConfig::load(path)?,
        None => DhtConfig::default(),
    };

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let local_addr = listener.local_addr()?;

    let id = derive_node_id(&rand::random::<[u8; 32]>());
    let self_contact = Contact::new(id, vec![local_addr.to_string()]);
    info!(node = %hex::encode(id), addr = %local_addr, "DHT node started");

    let directory = Arc::new(MemoryPeerDirectory::default());
    let transport = Arc::new(TcpTransport::new(
        self_contact.clone(),
        directory.clone(),
        &config,
    ));
    let super_peers: Vec<NodeId> = args.super_peers.iter().map(|peer| peer.0).collect();
    let fanout = super_peers.len().max(1);
    let node = Arc::new(
        DhtNode::builder(self_contact, transport)
            .super_peers(Arc::new(StaticSuperPeers::new(id, super_peers, fanout)))
            .directory(directory)
            .config(config)
            .build(),
    );

    for peer in &args.peers {
        info!(peer = %hex::encode(peer.id), addr = %peer.addr, "adding bootstrap peer");
        node.observe_contact(Contact::new(peer.id, vec![peer.addr.to_string()]))
            .await;
    }

    let mut server = tokio::spawn(serve(node.clone(), listener));
    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            result = &mut server => {
                match result {
                    Ok(Ok(())) => warn!("server stopped"),
                    Ok(Err(err)) => warn!("server failed: {err:#}"),
                    Err(err) => warn!("server task panicked: {err}"),
                }
                break;
            }
            _ = interval.tick() => {
                info!(peers = node.routing_table_len().await, "status");
            }
        }
    }

    Ok(())
}
