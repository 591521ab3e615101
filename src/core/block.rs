//! Block header implementation
//!
//! The 80-byte header is all an SPV client ever stores about a block. It
//! carries the proof of work and commits to the transactions via the
//! merkle root.

use crate::crypto::Hash256;
use crate::encode::{Decodable, Encodable, EncodeError};
use bytes::{Buf, BufMut};
use chrono::{DateTime, TimeZone, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Block Constants
// =============================================================================

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Block hashes and txids share the same representation
pub type BlockHash = Hash256;
pub type Txid = Hash256;

// =============================================================================
// Block Errors
// =============================================================================

/// Proof-of-work errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Invalid compact target {0:#010x}")]
    InvalidTarget(u32),
    #[error("Target {0:#010x} is easier than the network limit")]
    TargetAboveLimit(u32),
    #[error("Invalid proof of work for block {0}")]
    InvalidProofOfWork(BlockHash),
}

/// Block header containing metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: i32,
    /// Hash of the previous block
    pub prev_blockhash: BlockHash,
    /// Merkle root of all transactions
    pub merkle_root: Hash256,
    /// Block creation timestamp (unix seconds)
    pub time: u32,
    /// Compact difficulty target
    pub bits: u32,
    /// Nonce used for proof of work
    pub nonce: u32,
}

impl BlockHeader {
    /// Double-SHA256 of the 80-byte serialization
    pub fn block_hash(&self) -> BlockHash {
        let mut data = Vec::with_capacity(BLOCK_HEADER_SIZE);
        self.consensus_encode(&mut data);
        Hash256::hash(&data)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.time as i64, 0)
            .single()
            .unwrap_or_default()
    }

    /// Decoded target, or `None` if `bits` is negative or overflows
    pub fn target(&self) -> Option<U256> {
        compact_to_target(self.bits)
    }

    /// Expected number of hashes needed to produce this header
    pub fn work(&self) -> U256 {
        self.target().map(target_work).unwrap_or_default()
    }

    /// Check the hash against the target from `bits`, and that target
    /// against the network's limit.
    pub fn validate_pow(&self, pow_limit: U256) -> Result<(), BlockError> {
        let target = self
            .target()
            .filter(|t| !t.is_zero())
            .ok_or(BlockError::InvalidTarget(self.bits))?;
        if target > pow_limit {
            return Err(BlockError::TargetAboveLimit(self.bits));
        }

        let hash = self.block_hash();
        if hash.to_u256() > target {
            return Err(BlockError::InvalidProofOfWork(hash));
        }
        Ok(())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.version.consensus_encode(buf);
        self.prev_blockhash.consensus_encode(buf);
        self.merkle_root.consensus_encode(buf);
        self.time.consensus_encode(buf);
        self.bits.consensus_encode(buf);
        self.nonce.consensus_encode(buf);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            version: Decodable::consensus_decode(buf)?,
            prev_blockhash: Decodable::consensus_decode(buf)?,
            merkle_root: Decodable::consensus_decode(buf)?,
            time: Decodable::consensus_decode(buf)?,
            bits: Decodable::consensus_decode(buf)?,
            nonce: Decodable::consensus_decode(buf)?,
        })
    }
}

// =============================================================================
// Compact target encoding
// =============================================================================

/// Decode the compact `bits` representation of a target
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    // Sign bit set on a non-zero mantissa is a negative target
    if mantissa != 0 && bits & 0x0080_0000 != 0 {
        return None;
    }
    if mantissa != 0
        && (exponent > 34 || (mantissa > 0xff && exponent > 33) || (mantissa > 0xffff && exponent > 32))
    {
        return None;
    }

    let mantissa = U256::from(mantissa);
    Some(if exponent <= 3 {
        mantissa >> (8 * (3 - exponent) as usize)
    } else {
        mantissa << (8 * (exponent - 3) as usize)
    })
}

/// Encode a target into compact `bits`
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u32()
    };
    // Keep the sign bit clear
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// Work represented by a target: 2^256 / (target + 1)
pub fn target_work(target: U256) -> U256 {
    match target.checked_add(U256::one()) {
        Some(divisor) => (!target / divisor) + U256::one(),
        None => U256::one(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{Network, NetworkParams};
    use crate::encode::{deserialize, serialize};

    #[test]
    fn test_header_is_80_bytes() {
        let header = NetworkParams::new(Network::Main).genesis_header();
        let bytes = serialize(&header);
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        assert_eq!(deserialize::<BlockHeader>(&bytes).unwrap(), header);
    }

    #[test]
    fn test_mainnet_genesis_pow() {
        let params = NetworkParams::new(Network::Main);
        let header = params.genesis_header();
        assert_eq!(
            header.block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert!(header.validate_pow(params.pow_limit()).is_ok());
        assert_eq!(header.timestamp().timestamp(), 1231006505);
    }

    #[test]
    fn test_compact_round_trip() {
        let target = compact_to_target(0x1d00ffff).unwrap();
        assert_eq!(target, U256::from(0xffffu64) << 208);
        assert_eq!(target_to_compact(target), 0x1d00ffff);

        let regtest = compact_to_target(0x207fffff).unwrap();
        assert_eq!(target_to_compact(regtest), 0x207fffff);
    }

    #[test]
    fn test_negative_and_overflowing_targets() {
        assert_eq!(compact_to_target(0x04923456), None);
        assert_eq!(compact_to_target(0xff123456), None);
        assert_eq!(compact_to_target(0x00800000), Some(U256::zero()));
    }

    #[test]
    fn test_work() {
        let header = NetworkParams::new(Network::Main).genesis_header();
        assert_eq!(header.work(), U256::from(0x1_0001_0001u64));

        let regtest = NetworkParams::new(Network::Regtest).genesis_header();
        assert_eq!(regtest.work(), U256::from(2));
    }

    #[test]
    fn test_pow_rejects_bad_nonce() {
        let params = NetworkParams::new(Network::Main);
        let mut header = params.genesis_header();
        header.nonce += 1;
        assert!(matches!(
            header.validate_pow(params.pow_limit()),
            Err(BlockError::InvalidProofOfWork(_))
        ));
    }

    #[test]
    fn test_target_above_limit() {
        let params = NetworkParams::new(Network::Main);
        let mut header = params.genesis_header();
        header.bits = 0x207fffff;
        assert_eq!(
            header.validate_pow(params.pow_limit()),
            Err(BlockError::TargetAboveLimit(0x207fffff))
        );
    }
}
