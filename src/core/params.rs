//! Network parameters
//!
//! Everything that differs between mainnet, testnet and regtest: message
//! magic, default port, genesis header, proof-of-work limit and address
//! encodings.

use super::block::{compact_to_target, BlockHeader};
use crate::crypto::Hash256;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Merkle root shared by every network's genesis block (internal byte order)
const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
];

/// Supported networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Testnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Main => write!(f, "main"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "main" | "mainnet" | "bitcoin" => Ok(Network::Main),
            "test" | "testnet" | "testnet3" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Parameters for one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub network: Network,
    /// Message start bytes
    pub magic: [u8; 4],
    pub default_port: u16,
    /// Easiest allowed compact target
    pub pow_limit_bits: u32,
    pub p2pkh_prefix: u8,
    pub p2sh_prefix: u8,
    pub bech32_hrp: &'static str,
    genesis_time: u32,
    genesis_bits: u32,
    genesis_nonce: u32,
}

impl NetworkParams {
    pub fn new(network: Network) -> Self {
        match network {
            Network::Main => Self {
                network,
                magic: [0xf9, 0xbe, 0xb4, 0xd9],
                default_port: 8333,
                pow_limit_bits: 0x1d00ffff,
                p2pkh_prefix: 0x00,
                p2sh_prefix: 0x05,
                bech32_hrp: "bc",
                genesis_time: 1231006505,
                genesis_bits: 0x1d00ffff,
                genesis_nonce: 2083236893,
            },
            Network::Testnet => Self {
                network,
                magic: [0x0b, 0x11, 0x09, 0x07],
                default_port: 18333,
                pow_limit_bits: 0x1d00ffff,
                p2pkh_prefix: 0x6f,
                p2sh_prefix: 0xc4,
                bech32_hrp: "tb",
                genesis_time: 1296688602,
                genesis_bits: 0x1d00ffff,
                genesis_nonce: 414098458,
            },
            Network::Regtest => Self {
                network,
                magic: [0xfa, 0xbf, 0xb5, 0xda],
                default_port: 18444,
                pow_limit_bits: 0x207fffff,
                p2pkh_prefix: 0x6f,
                p2sh_prefix: 0xc4,
                bech32_hrp: "bcrt",
                genesis_time: 1296688602,
                genesis_bits: 0x207fffff,
                genesis_nonce: 2,
            },
        }
    }

    /// The hard-coded first header of the chain
    pub fn genesis_header(&self) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: Hash256::ZERO,
            merkle_root: Hash256(GENESIS_MERKLE_ROOT),
            time: self.genesis_time,
            bits: self.genesis_bits,
            nonce: self.genesis_nonce,
        }
    }

    pub fn pow_limit(&self) -> U256 {
        compact_to_target(self.pow_limit_bits).unwrap_or_default()
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self::new(Network::Testnet)
    }
}
