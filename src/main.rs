//! The braid daemon.

use std::path::PathBuf;
use std::sync::Arc;

use braid::config::{load_config, Config, CONFIG_FILE_NAME};
use braid::node::Node;
use braid_net::mem::MemNetwork;
use clap::Parser;
use multiaddr::Multiaddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "braidd", about = "braid daemon", version)]
struct Args {
    /// Repository directory.
    #[arg(long)]
    repo: Option<PathBuf>,
    /// Host listen multiaddress.
    #[arg(long)]
    host: Option<Multiaddr>,
    /// API bind multiaddress.
    #[arg(long)]
    api: Option<Multiaddr>,
    /// Verbose logging.
    #[arg(long)]
    debug: bool,
    /// Trade memory for disk where possible.
    #[arg(long)]
    low_mem: bool,
    /// Bootstrap peers, repeatable.
    #[arg(long = "bootstrap")]
    bootstrap_peers: Vec<Multiaddr>,
}

impl Args {
    fn apply(self, mut config: Config) -> Config {
        if let Some(repo) = self.repo {
            config.repo_path = repo;
        }
        if let Some(host) = self.host {
            config.host_addr = host;
        }
        if let Some(api) = self.api {
            config.api_addr = api;
        }
        config.debug |= self.debug;
        config.low_mem |= self.low_mem;
        config.bootstrap_peers.extend(self.bootstrap_peers);
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(err) = run(args).await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let file = args
        .repo
        .clone()
        .unwrap_or_else(|| Config::default().repo_path)
        .join(CONFIG_FILE_NAME);
    let config = args.apply(load_config(Some(&file))?);
    info!(repo = %config.repo_path.display(), host = %config.host_addr, "starting braid");

    // The network transport is pluggable; the daemon ships with the
    // in-process network, serving embedders within this process.
    let (datastore, identity) = Node::open_repo(&config)?;
    let network = MemNetwork::new();
    let (transport, gossip) = network.attach(identity.public().to_peer_id());
    let node = Node::spawn(
        datastore,
        Arc::new(transport),
        Arc::new(gossip),
        braid_net::NetConfig::default(),
    )
    .await?;
    info!(peer = %node.net().local_peer(), "ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.close().await;
    Ok(())
}
