//! CLI entry point (spec.md §6): `start-node`, `version`,
//! `network status|peers`. Environment overrides and exit codes follow
//! §6 exactly: 0 ok, 1 config error, 2 state corruption, 3 fatal
//! network.

mod network;

use clap::{Args, Parser, Subcommand};
use ledger_core::Block;
use network::{P2PConfig, P2PNode};
use node_core::Node;
use shared::{KeyPair, NodeConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_STATE_CORRUPTION: u8 = 2;
const EXIT_FATAL_NETWORK: u8 = 3;

/// Current Unix timestamp, used for block timestamps and signed-envelope
/// freshness checks.
fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

#[derive(Parser)]
#[command(name = "xai-node")]
#[command(about = "xai proof-of-work node: ledger, HTLC swaps, gas sponsorship, AI safety kernel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the node: mines (if `--miner` is given), serves the RPC
    /// state this binary exposes in-process, and joins the P2P swarm.
    StartNode(StartNodeArgs),
    /// Prints version information and exits.
    Version,
    /// Network introspection.
    #[command(subcommand)]
    Network(NetworkCommands),
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// Prints this node's chain height, tip and mempool size.
    Status,
    /// Prints this node's configured bootstrap peers.
    Peers,
}

#[derive(Args)]
struct StartNodeArgs {
    /// Bind host, overrides `XAI_HOST`.
    #[arg(long)]
    host: Option<String>,
    /// P2P/RPC port, overrides `XAI_PORT`.
    #[arg(long)]
    port: Option<u16>,
    /// Address credited with mined block rewards. Omit to run as a
    /// relay/validator that never mines.
    #[arg(long)]
    miner: Option<String>,
    /// Bootstrap peer multiaddrs to dial at startup.
    #[arg(long = "peers")]
    peers: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(code) => ExitCode::from(code),
    }
}

fn run(cli: Cli) -> Result<u8, u8> {
    match cli.command {
        Commands::Version => {
            println!("xai-node {}", env!("CARGO_PKG_VERSION"));
            Ok(EXIT_OK)
        }
        Commands::Network(cmd) => run_network_command(cmd),
        Commands::StartNode(args) => run_start_node(args),
    }
}

fn run_network_command(cmd: NetworkCommands) -> Result<u8, u8> {
    let config = NodeConfig::from_env();
    let now = unix_now();
    let node = build_node(config, now).map_err(|err| {
        error!(error = %err, "failed to initialize node state");
        EXIT_STATE_CORRUPTION
    })?;

    match cmd {
        NetworkCommands::Status => {
            let snapshot = node.state_snapshot();
            println!("height={} tip={} mempool={}", snapshot.height, snapshot.tip, snapshot.mempool_size);
        }
        NetworkCommands::Peers => {
            for peer in &node.config.bootstrap_peers {
                println!("{peer}");
            }
        }
    }
    Ok(EXIT_OK)
}

fn run_start_node(args: StartNodeArgs) -> Result<u8, u8> {
    let mut config = NodeConfig::from_env();
    if let Some(host) = args.host {
        config.bind_address = host;
    }
    if let Some(port) = args.port {
        config.p2p_port = port;
        config.rpc_port = port;
    }
    if !args.peers.is_empty() {
        config.bootstrap_peers = args.peers;
    }

    if let Some(miner_address) = &args.miner {
        if !shared::is_valid_address(miner_address) {
            error!(address = %miner_address, "--miner is not a valid bech32 address");
            return Err(EXIT_CONFIG_ERROR);
        }
    }

    let now = unix_now();
    let node = build_node(config.clone(), now).map_err(|err| {
        error!(error = %err, "failed to initialize node state");
        EXIT_STATE_CORRUPTION
    })?;
    let node = Arc::new(node);

    info!(
        height = node.state_snapshot().height,
        network = ?node.config.network,
        "node initialized"
    );

    let runtime = tokio::runtime::Runtime::new().map_err(|err| {
        error!(error = %err, "failed to start async runtime");
        EXIT_FATAL_NETWORK
    })?;

    let p2p_config = P2PConfig {
        listen_addr: config.bind_address.clone(),
        port: config.p2p_port,
        bootstrap_peers: config.bootstrap_peers.clone(),
        network_id: format!("xai-{:?}", config.network).to_lowercase(),
    };
    let envelope_key = KeyPair::generate().map_err(|err| {
        error!(error = %err, "failed to generate peer envelope signing key");
        EXIT_FATAL_NETWORK
    })?;

    let p2p = P2PNode::new(&p2p_config, envelope_key, Arc::clone(&node)).map_err(|err| {
        error!(error = %err, "failed to start P2P transport");
        EXIT_FATAL_NETWORK
    })?;

    if let Some(miner_address) = args.miner {
        let mining_node = Arc::clone(&node);
        std::thread::spawn(move || loop {
            let now = unix_now();
            match mining_node.mine_block(&miner_address, now) {
                Ok(block) => info!(height = block.header.index, "mined block"),
                Err(err) => {
                    tracing::debug!(error = %err, "mining attempt did not produce a block");
                    std::thread::sleep(std::time::Duration::from_millis(500));
                }
            }
        });
    }

    runtime.block_on(p2p.run(unix_now));
    Ok(EXIT_OK)
}

fn build_node(config: NodeConfig, now: i64) -> shared::Result<Node> {
    std::fs::create_dir_all(&config.data_dir).map_err(|err| shared::BlockchainError::PersistenceError(err.to_string()))?;

    let genesis_path = std::path::PathBuf::from(format!("{}/chain/genesis.json", config.data_dir));
    let genesis = shared::persist::read_json::<Block>(&genesis_path)?.unwrap_or_else(|| {
        Block::genesis(
            ledger_core::block_reward(0),
            "genesis".to_string(),
            now,
            config.consensus.initial_difficulty,
        )
        .expect("genesis block construction with difficulty 1 always terminates")
    });
    shared::persist::write_json_atomic(&genesis_path, &genesis)?;

    Node::new(config, genesis, now)
}
