//! Merkle tree implementation for transaction verification
//!
//! Bitcoin-style merkle roots (odd levels duplicate their last node) and the
//! BIP37 partial merkle tree used by `merkleblock` messages.

use super::hash::Hash256;
use crate::encode::{
    read_list, read_var_bytes, write_list, write_var_bytes, Decodable, Encodable, EncodeError,
};
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Largest transaction count a block can hold (max weight / min tx weight)
pub const MAX_BLOCK_TRANSACTIONS: u32 = 4_000_000 / 240;

/// Partial merkle tree verification errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Partial tree declares no transactions")]
    NoTransactions,
    #[error("Partial tree declares {0} transactions, more than a block can hold")]
    TooManyTransactions(u32),
    #[error("More hashes ({hashes}) than transactions ({total})")]
    TooManyHashes { hashes: usize, total: u32 },
    #[error("Fewer flag bits ({bits}) than hashes ({hashes})")]
    NotEnoughBits { bits: usize, hashes: usize },
    #[error("Ran out of flag bits while traversing")]
    BitsExhausted,
    #[error("Ran out of hashes while traversing")]
    HashesExhausted,
    #[error("Identical sibling hashes at height {0}")]
    DuplicateSibling(u32),
    #[error("{0} hashes left unused")]
    UnusedHashes(usize),
    #[error("Flag bits left unused")]
    UnusedBits,
    #[error("Merkle root mismatch: expected {expected}, computed {actual}")]
    RootMismatch { expected: Hash256, actual: Hash256 },
    #[error("Merkle block header does not match the chain header {0}")]
    HeaderMismatch(Hash256),
}

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }

    let mut current_level: Vec<Hash256> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|pair| Hash256::combine(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }

    current_level[0]
}

/// Result of walking a partial merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMatches {
    /// Root reconstructed from the supplied hashes
    pub root: Hash256,
    /// Matched transaction hashes, in block order
    pub txids: Vec<Hash256>,
    /// Position of each match within the block
    pub indexes: Vec<u32>,
}

/// BIP37 partial merkle tree: a depth-first encoding of the pruned tree
/// where each flag bit says whether a node was descended into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMerkleTree {
    total: u32,
    hashes: Vec<Hash256>,
    bits: Vec<bool>,
}

impl PartialMerkleTree {
    /// Build from raw parts (as received on the wire)
    pub fn from_parts(total: u32, hashes: Vec<Hash256>, flag_bytes: &[u8]) -> Self {
        let bits = (0..flag_bytes.len() * 8)
            .map(|i| flag_bytes[i / 8] & (1 << (i % 8)) != 0)
            .collect();
        Self {
            total,
            hashes,
            bits,
        }
    }

    /// Build the proof for `txids`, keeping the leaves whose `matches` entry is set
    pub fn from_txids(txids: &[Hash256], matches: &[bool]) -> Self {
        let mut tree = Self {
            total: txids.len() as u32,
            hashes: Vec::new(),
            bits: Vec::new(),
        };
        if txids.is_empty() {
            return tree;
        }

        let height = tree.tree_height();
        tree.build(height, 0, txids, matches);
        tree
    }

    pub fn total_transactions(&self) -> u32 {
        self.total
    }

    pub fn hashes(&self) -> &[Hash256] {
        &self.hashes
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Flag bits packed LSB-first, as sent on the wire
    pub fn flag_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; (self.bits.len() + 7) / 8];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Flip a single flag bit
    pub fn toggle_bit(&mut self, index: usize) {
        if let Some(bit) = self.bits.get_mut(index) {
            *bit = !*bit;
        }
    }

    /// Replace one of the supplied hashes
    pub fn set_hash(&mut self, index: usize, hash: Hash256) {
        if let Some(slot) = self.hashes.get_mut(index) {
            *slot = hash;
        }
    }

    /// Reconstruct the root and collect the matched leaves.
    ///
    /// Fails when the flag/hash counts are inconsistent with the tree shape;
    /// the caller still has to compare `root` with the header.
    pub fn extract_matches(&self) -> Result<ExtractedMatches, MerkleError> {
        if self.total == 0 {
            return Err(MerkleError::NoTransactions);
        }
        if self.total > MAX_BLOCK_TRANSACTIONS {
            return Err(MerkleError::TooManyTransactions(self.total));
        }
        if self.hashes.len() > self.total as usize {
            return Err(MerkleError::TooManyHashes {
                hashes: self.hashes.len(),
                total: self.total,
            });
        }
        if self.bits.len() < self.hashes.len() {
            return Err(MerkleError::NotEnoughBits {
                bits: self.bits.len(),
                hashes: self.hashes.len(),
            });
        }

        let mut walk = Walk {
            bits_used: 0,
            hashes_used: 0,
            txids: Vec::new(),
            indexes: Vec::new(),
        };
        let root = self.extract(self.tree_height(), 0, &mut walk)?;

        // Everything but the final byte's padding must be consumed.
        if (walk.bits_used + 7) / 8 != (self.bits.len() + 7) / 8 {
            return Err(MerkleError::UnusedBits);
        }
        if walk.hashes_used != self.hashes.len() {
            return Err(MerkleError::UnusedHashes(self.hashes.len() - walk.hashes_used));
        }

        Ok(ExtractedMatches {
            root,
            txids: walk.txids,
            indexes: walk.indexes,
        })
    }

    fn tree_width(&self, height: u32) -> u32 {
        (self.total + (1 << height) - 1) >> height
    }

    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.tree_width(height) > 1 {
            height += 1;
        }
        height
    }

    fn calc_hash(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.calc_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        Hash256::combine(&left, &right)
    }

    fn build(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        let start = (pos << height) as usize;
        let end = (((pos + 1) << height) as usize).min(txids.len());
        let parent_of_match = (start..end).any(|i| matches.get(i).copied().unwrap_or(false));

        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            let hash = self.calc_hash(height, pos, txids);
            self.hashes.push(hash);
        } else {
            self.build(height - 1, pos * 2, txids, matches);
            if pos * 2 + 1 < self.tree_width(height - 1) {
                self.build(height - 1, pos * 2 + 1, txids, matches);
            }
        }
    }

    fn extract(&self, height: u32, pos: u32, walk: &mut Walk) -> Result<Hash256, MerkleError> {
        let parent_of_match = *self
            .bits
            .get(walk.bits_used)
            .ok_or(MerkleError::BitsExhausted)?;
        walk.bits_used += 1;

        if height == 0 || !parent_of_match {
            let hash = *self
                .hashes
                .get(walk.hashes_used)
                .ok_or(MerkleError::HashesExhausted)?;
            walk.hashes_used += 1;
            if height == 0 && parent_of_match {
                walk.txids.push(hash);
                walk.indexes.push(pos);
            }
            return Ok(hash);
        }

        let left = self.extract(height - 1, pos * 2, walk)?;
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            let right = self.extract(height - 1, pos * 2 + 1, walk)?;
            // CVE-2012-2459: a duplicated subtree would let two trees share a root.
            if right == left {
                return Err(MerkleError::DuplicateSibling(height - 1));
            }
            right
        } else {
            left
        };

        Ok(Hash256::combine(&left, &right))
    }
}

struct Walk {
    bits_used: usize,
    hashes_used: usize,
    txids: Vec<Hash256>,
    indexes: Vec<u32>,
}

impl Encodable for PartialMerkleTree {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.total.consensus_encode(buf);
        write_list(buf, &self.hashes);
        write_var_bytes(buf, &self.flag_bytes());
    }
}

impl Decodable for PartialMerkleTree {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let total = u32::consensus_decode(buf)?;
        let hashes = read_list(buf, MAX_BLOCK_TRANSACTIONS as u64)?;
        let flags = read_var_bytes(buf)?;
        Ok(Self::from_parts(total, hashes, &flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{deserialize, serialize};

    fn txids(n: u32) -> Vec<Hash256> {
        (0..n).map(|i| Hash256::hash(&i.to_le_bytes())).collect()
    }

    #[test]
    fn test_merkle_root_single() {
        let hashes = txids(1);
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let hashes = txids(3);
        let left = Hash256::combine(&hashes[0], &hashes[1]);
        let right = Hash256::combine(&hashes[2], &hashes[2]);
        assert_eq!(calculate_merkle_root(&hashes), Hash256::combine(&left, &right));
    }

    #[test]
    fn test_partial_tree_extracts_matches_in_order() {
        for total in [1u32, 2, 3, 7, 16, 33] {
            let ids = txids(total);
            let matches: Vec<bool> = (0..total).map(|i| i % 3 == 0).collect();
            let tree = PartialMerkleTree::from_txids(&ids, &matches);

            let extracted = tree.extract_matches().unwrap();
            assert_eq!(extracted.root, calculate_merkle_root(&ids), "total {}", total);

            let expected: Vec<u32> = (0..total).filter(|i| i % 3 == 0).collect();
            assert_eq!(extracted.indexes, expected);
            let expected_ids: Vec<Hash256> = expected.iter().map(|i| ids[*i as usize]).collect();
            assert_eq!(extracted.txids, expected_ids);
        }
    }

    #[test]
    fn test_partial_tree_without_matches_is_just_the_root() {
        let ids = txids(5);
        let tree = PartialMerkleTree::from_txids(&ids, &[false; 5]);
        assert_eq!(tree.hashes().len(), 1);

        let extracted = tree.extract_matches().unwrap();
        assert!(extracted.txids.is_empty());
        assert_eq!(extracted.root, calculate_merkle_root(&ids));
    }

    #[test]
    fn test_wire_format_survives_flag_packing() {
        let ids = txids(9);
        let mut matches = vec![false; 9];
        matches[4] = true;
        matches[8] = true;
        let tree = PartialMerkleTree::from_txids(&ids, &matches);

        let decoded: PartialMerkleTree = deserialize(&serialize(&tree)).unwrap();
        // Decoding pads the bit vector out to whole bytes.
        assert_eq!(decoded.bits().len() % 8, 0);
        assert_eq!(decoded.extract_matches().unwrap(), tree.extract_matches().unwrap());
    }

    #[test]
    fn test_flipped_root_bit_is_rejected() {
        let ids = txids(4);
        let mut tree = PartialMerkleTree::from_txids(&ids, &[false, true, false, false]);
        tree.toggle_bit(0);
        assert!(matches!(
            tree.extract_matches(),
            Err(MerkleError::UnusedHashes(_))
        ));
    }

    #[test]
    fn test_tampered_hash_changes_root() {
        let ids = txids(6);
        let mut tree = PartialMerkleTree::from_txids(&ids, &[true, false, false, false, false, false]);
        tree.set_hash(1, Hash256::hash(b"forged"));
        let extracted = tree.extract_matches().unwrap();
        assert_ne!(extracted.root, calculate_merkle_root(&ids));
    }

    #[test]
    fn test_shape_errors() {
        let empty = PartialMerkleTree::from_parts(0, vec![], &[]);
        assert_eq!(empty.extract_matches(), Err(MerkleError::NoTransactions));

        let huge = PartialMerkleTree::from_parts(MAX_BLOCK_TRANSACTIONS + 1, vec![], &[1]);
        assert!(matches!(
            huge.extract_matches(),
            Err(MerkleError::TooManyTransactions(_))
        ));

        let too_many = PartialMerkleTree::from_parts(1, txids(2), &[0]);
        assert!(matches!(
            too_many.extract_matches(),
            Err(MerkleError::TooManyHashes { .. })
        ));

        let no_hashes = PartialMerkleTree::from_parts(2, vec![], &[0b1]);
        assert_eq!(no_hashes.extract_matches(), Err(MerkleError::HashesExhausted));
    }

    #[test]
    fn test_duplicate_siblings_rejected() {
        let ids = txids(1);
        let duplicated = vec![ids[0], ids[0]];
        let tree = PartialMerkleTree::from_txids(&duplicated, &[true, true]);
        assert_eq!(tree.extract_matches(), Err(MerkleError::DuplicateSibling(0)));
    }
}
