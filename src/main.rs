//! SPV node CLI application
//!
//! A command-line interface for running a lightweight Bitcoin SPV node.

use clap::{Parser, Subcommand};
use spv_node::cli;
use spv_node::core::{BloomFlags, Network};
use spv_node::network::NodeConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "spv")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A lightweight SPV node: header sync, bloom filters, merkle proofs", long_about = None)]
struct Cli {
    /// Network: main, testnet or regtest
    #[arg(short, long, default_value = "testnet")]
    network: Network,

    /// Data directory for headers and matches
    #[arg(short, long, default_value = ".spv_data")]
    data_dir: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until Ctrl+C
    Start {
        /// Comma-separated peers (host:port, or host on the default port)
        #[arg(short, long)]
        peers: Option<String>,

        /// Comma-separated addresses, outpoints or hex scripts to watch
        #[arg(short, long)]
        watch: Option<String>,

        /// Accept inbound peers on this port
        #[arg(short, long)]
        listen: Option<u16>,

        /// Keep headers in memory only
        #[arg(long)]
        memory: bool,

        /// Maximum outbound connections
        #[arg(long, default_value = "8")]
        max_outbound: usize,

        /// Bloom filter false positive rate
        #[arg(long, default_value = "0.0001")]
        fp_rate: f64,

        /// Bloom update flags: none, all or pubkey-only
        #[arg(long, default_value = "none")]
        bloom_flags: BloomFlags,

        /// Seconds a peer has to finish the handshake
        #[arg(long, default_value = "10")]
        handshake_timeout: u64,
    },

    /// Parse an address and print its script
    Address {
        /// Address to parse
        address: String,
    },

    /// Decode a hex block header and print its hash
    Header {
        /// 80-byte header as hex
        header: String,
    },
}

fn split_list(list: Option<String>) -> Vec<String> {
    list.map(|l| {
        l.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Address { address } => cli::cmd_address(cli.network, &address),
        Commands::Header { header } => cli::cmd_header(cli.network, &header),
        Commands::Start {
            peers,
            watch,
            listen,
            memory,
            max_outbound,
            fp_rate,
            bloom_flags,
            handshake_timeout,
        } => {
            let config = NodeConfig {
                network: cli.network,
                data_dir: cli.data_dir,
                memory,
                listen_port: listen,
                max_outbound,
                handshake_timeout: Duration::from_secs(handshake_timeout),
                false_positive_rate: fp_rate,
                bloom_flags,
                ..NodeConfig::default()
            };

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_start(config, split_list(peers), split_list(watch)))
        }
    }
}
