use anyhow::Result;
use clap::{Parser, Subcommand};
use coinprune::lifecycle::CompactionConfig;
use coinprune::node::{Node, NodeOptions};
use coinprune::rpc;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "coinprune")]
#[command(about = "UTXO-set snapshot engine for fast node bootstrap", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node
    Node {
        /// Data directory
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Port to listen on for P2P
        #[arg(long, default_value = "9333")]
        port: u16,

        /// Port for RPC server
        #[arg(long, default_value = "8545")]
        rpc_port: u16,

        /// Peer addresses to connect to
        #[arg(long)]
        peer: Vec<SocketAddr>,

        /// Bootstrap the UTXO set from a downloaded state
        #[arg(long)]
        compaction: bool,

        /// Serve states to joining peers and confirm them when mining
        #[arg(long)]
        provide_state: bool,

        /// Load this local state file at startup instead of downloading
        #[arg(long)]
        statename: Option<String>,

        /// Delete block files below the last confirmed state
        #[arg(long)]
        prune: bool,
    },

    /// Schedule writing a state file via RPC
    Createstate {
        /// RPC port
        #[arg(long, default_value = "8545")]
        rpc_port: u16,

        /// Height of the last block to include, or 0 for the tip
        #[arg(long, default_value = "0")]
        max_height: u32,
    },

    /// Load a state file into the UTXO database via RPC
    Loadstate {
        /// RPC port
        #[arg(long, default_value = "8545")]
        rpc_port: u16,

        /// State file name inside the state directory
        #[arg(long)]
        file: String,
    },

    /// Check whether the node is ready to serve states
    Readytoserve {
        /// RPC port
        #[arg(long, default_value = "8545")]
        rpc_port: u16,
    },

    /// Show the node's snapshot status
    Status {
        /// RPC port
        #[arg(long, default_value = "8545")]
        rpc_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinprune=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Node {
            data_dir,
            port,
            rpc_port,
            peer,
            compaction,
            provide_state,
            statename,
            prune,
        } => {
            let config = CompactionConfig {
                compaction,
                provide_state,
                statename,
                prune,
            };
            run_node(data_dir, port, rpc_port, peer, config).await
        }

        Command::Createstate {
            rpc_port,
            max_height,
        } => create_state(rpc_port, max_height).await,

        Command::Loadstate { rpc_port, file } => load_state(rpc_port, file).await,

        Command::Readytoserve { rpc_port } => ready_to_serve(rpc_port).await,

        Command::Status { rpc_port } => status(rpc_port).await,
    }
}

async fn run_node(
    data_dir: PathBuf,
    port: u16,
    rpc_port: u16,
    peers: Vec<SocketAddr>,
    config: CompactionConfig,
) -> Result<()> {
    let listen_addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let node = Node::new(NodeOptions {
        data_dir,
        listen_addr,
        bootstrap_peers: peers,
        compaction: config.clone(),
    })?;

    let (handle, cmd_rx) = node.create_handle();

    let rpc_server = rpc::RpcServer::new(rpc_port);
    let handle_clone = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = rpc_server.run(handle_clone).await {
            tracing::error!("RPC server error: {}", e);
        }
    });

    tracing::info!(
        "Node started (compaction: {}, provide_state: {}, rpc: {})",
        config.compaction,
        config.provide_state,
        rpc_port
    );

    node.run(cmd_rx).await
}

async fn create_state(rpc_port: u16, max_height: u32) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/createstate", rpc_port);

    let req = rpc::CreateStateRequest { max_height };
    let response = client.post(&url).json(&req).send().await?;

    if response.status().is_success() {
        let result: rpc::StatusStringResponse = response.json().await?;
        println!("{}", result.status);
    } else {
        let error: rpc::ErrorResponse = response.json().await?;
        println!("Error: {}", error.error);
    }
    Ok(())
}

async fn load_state(rpc_port: u16, file: String) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/loadstate", rpc_port);

    let req = rpc::LoadStateRequest { file };
    let response = client.post(&url).json(&req).send().await?;

    if response.status().is_success() {
        let result: rpc::StatusStringResponse = response.json().await?;
        println!("{}", result.status);
    } else {
        let error: rpc::ErrorResponse = response.json().await?;
        println!("Error: {}", error.error);
    }
    Ok(())
}

async fn ready_to_serve(rpc_port: u16) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/readytoserve", rpc_port);

    let response: rpc::ReadyToServeResponse = client.get(&url).send().await?.json().await?;
    println!("readytoserve: {}", response.ready);
    Ok(())
}

async fn status(rpc_port: u16) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/state", rpc_port);

    let response: rpc::GetStatusResponse = client.get(&url).send().await?.json().await?;

    println!("Status:");
    println!("  Tip height:    {:?}", response.tip_height);
    println!("  Headers known: {}", response.header_best_known);
    println!("  Coins:         {}", response.coin_count);
    println!("  Sync complete: {}", response.sync_complete);
    println!("  Full sync:     {}", response.full_sync_mode);
    println!("  Loading:       {}", response.loading);
    for (label, state) in [
        ("Current", &response.current),
        ("Previous", &response.prev),
        ("Downloaded", &response.downloaded),
    ] {
        match state {
            Some(s) => println!(
                "  {}: height {} hash {} (confirmed: {})",
                label, s.height, s.state_hash, s.confirmed
            ),
            None => println!("  {}: none", label),
        }
    }
    Ok(())
}
