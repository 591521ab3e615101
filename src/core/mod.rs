//! Core chain components
//!
//! This module contains the building blocks an SPV client needs:
//! - Block headers (proof of work, compact targets)
//! - Transactions (parsing, txids)
//! - Header chain (best chain, side branches, reorgs)
//! - Merkle blocks (filtered block verification)
//! - SPV support (bloom filters, watch set)
//! - Network parameters

pub mod block;
pub mod chain;
pub mod merkle_block;
pub mod params;
pub mod script;
pub mod spv;
pub mod transaction;

pub use block::{BlockError, BlockHash, BlockHeader, Txid, BLOCK_HEADER_SIZE};
pub use chain::{
    AppendOutcome, ChainEntry, ChainError, HeaderChain, DEFAULT_MAX_REORG_DEPTH,
    MAX_FUTURE_BLOCK_TIME, MTP_BLOCK_COUNT,
};
pub use merkle_block::{MerkleBlock, MerkleProofVerifier, VerifiedMatches};
pub use params::{Network, NetworkParams};
pub use script::ScriptType;
pub use spv::{
    AddressWatchSet, BloomError, BloomFilter, BloomFlags, WatchedItem,
    DEFAULT_FALSE_POSITIVE_RATE,
};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
