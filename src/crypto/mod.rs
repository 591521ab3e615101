//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / RIPEMD-160 hashing
//! - MurmurHash3 for bloom filters
//! - Merkle roots and BIP37 partial merkle trees
//! - Address decoding

pub mod address;
pub mod hash;
pub mod merkle;
pub mod murmur;

pub use address::{Address, AddressError, Payload};
pub use hash::{double_sha256, hash160, sha256, Hash256};
pub use merkle::{calculate_merkle_root, MerkleError, PartialMerkleTree};
