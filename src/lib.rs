//! SPV Node: a lightweight Bitcoin client in Rust
//!
//! This crate implements Simplified Payment Verification:
//! - Header-first sync with proof-of-work, median-time and reorg handling
//! - BIP37 bloom filters built from a watch set of addresses and scripts
//! - Partial merkle tree verification of filtered blocks
//! - Bitcoin wire protocol framing and the peer handshake state machine
//! - A peer pool with connection limits, backoff and session bans
//! - Event delivery of matched transactions and blocks
//! - JSON persistence of headers and matches
//!
//! # Example
//!
//! ```no_run
//! use spv_node::network::{NodeConfig, SpvNode};
//!
//! # async fn run() -> Result<(), spv_node::SpvError> {
//! let mut node = SpvNode::new(NodeConfig::default())?;
//! node.on_transaction(|event| println!("matched {}", event.txid)).await;
//!
//! node.open().await?;
//! node.watch_address("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx").await?;
//! node.connect_peer("127.0.0.1:18333").await?.wait().await?;
//! node.start_sync().await?;
//! # node.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod encode;
pub mod error;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use core::{
    AddressWatchSet, BlockHeader, BloomFilter, BloomFlags, HeaderChain, MerkleBlock,
    MerkleProofVerifier, Network, NetworkParams, Transaction, WatchedItem,
};
pub use crypto::{Address, Hash256};
pub use error::SpvError;
pub use network::{NodeConfig, NodeStatus, SpvEvent, SpvNode};
pub use storage::{ChainStore, FileStore, MemoryStore};
