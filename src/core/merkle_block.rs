//! Filtered blocks and their verification
//!
//! A `merkleblock` carries a header plus a partial merkle tree proving which
//! transactions matched the peer's copy of our bloom filter. The matched
//! txids come out of the tree walk, never from the peer directly.

use super::block::{BlockHash, BlockHeader, Txid};
use crate::crypto::merkle::{MerkleError, PartialMerkleTree};
use crate::encode::{Decodable, Encodable, EncodeError};
use bytes::{Buf, BufMut};

/// Header plus partial merkle tree, as sent in `merkleblock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub tree: PartialMerkleTree,
}

impl MerkleBlock {
    /// Build a filtered block from the block's txids and a match mask
    pub fn from_txids(header: BlockHeader, txids: &[Txid], matches: &[bool]) -> Self {
        Self {
            header,
            tree: PartialMerkleTree::from_txids(txids, matches),
        }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

impl Encodable for MerkleBlock {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.header.consensus_encode(buf);
        self.tree.consensus_encode(buf);
    }
}

impl Decodable for MerkleBlock {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            header: Decodable::consensus_decode(buf)?,
            tree: Decodable::consensus_decode(buf)?,
        })
    }
}

/// Transactions proven to be included in a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMatches {
    pub block_hash: BlockHash,
    /// Matched txids in block order
    pub txids: Vec<Txid>,
    /// Position of each matched txid within the block
    pub indexes: Vec<u32>,
}

impl VerifiedMatches {
    pub fn is_empty(&self) -> bool {
        self.txids.is_empty()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.txids.contains(txid)
    }
}

/// Checks partial merkle trees against trusted headers
pub struct MerkleProofVerifier;

impl MerkleProofVerifier {
    /// Verify `tree` against the merkle root committed to by `header`
    pub fn verify(
        header: &BlockHeader,
        tree: &PartialMerkleTree,
    ) -> Result<VerifiedMatches, MerkleError> {
        let extracted = tree.extract_matches()?;
        if extracted.root != header.merkle_root {
            return Err(MerkleError::RootMismatch {
                expected: header.merkle_root,
                actual: extracted.root,
            });
        }

        Ok(VerifiedMatches {
            block_hash: header.block_hash(),
            txids: extracted.txids,
            indexes: extracted.indexes,
        })
    }

    /// Verify a received `merkleblock` against the header the chain holds
    /// for it. The header in the message must be that exact header.
    pub fn verify_block(
        chain_header: &BlockHeader,
        block: &MerkleBlock,
    ) -> Result<VerifiedMatches, MerkleError> {
        if block.header != *chain_header {
            return Err(MerkleError::HeaderMismatch(block.block_hash()));
        }
        Self::verify(chain_header, &block.tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::merkle::calculate_merkle_root;
    use crate::crypto::Hash256;
    use crate::encode::{deserialize, serialize};

    fn block_with(n: u32) -> (BlockHeader, Vec<Txid>) {
        let txids: Vec<Txid> = (0..n).map(|i| Hash256::hash(&[i as u8, 0xaa])).collect();
        let header = BlockHeader {
            version: 4,
            prev_blockhash: Hash256::hash(b"parent"),
            merkle_root: calculate_merkle_root(&txids),
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        };
        (header, txids)
    }

    #[test]
    fn test_valid_proof() {
        let (header, txids) = block_with(10);
        let mut mask = vec![false; 10];
        mask[3] = true;
        mask[7] = true;
        let block = MerkleBlock::from_txids(header, &txids, &mask);

        let verified = MerkleProofVerifier::verify_block(&header, &block).unwrap();
        assert_eq!(verified.txids, vec![txids[3], txids[7]]);
        assert_eq!(verified.indexes, vec![3, 7]);
        assert_eq!(verified.block_hash, header.block_hash());
        assert!(verified.contains(&txids[7]));
    }

    #[test]
    fn test_root_mismatch() {
        let (mut header, txids) = block_with(4);
        let block = MerkleBlock::from_txids(header, &txids, &[true, false, false, false]);
        header.merkle_root = Hash256::hash(b"other");
        assert!(matches!(
            MerkleProofVerifier::verify(&header, &block.tree),
            Err(MerkleError::RootMismatch { .. })
        ));
    }

    #[test]
    fn test_header_must_match_chain() {
        let (header, txids) = block_with(2);
        let block = MerkleBlock::from_txids(header, &txids, &[true, true]);
        let mut other = header;
        other.nonce = 99;
        assert!(matches!(
            MerkleProofVerifier::verify_block(&other, &block),
            Err(MerkleError::HeaderMismatch(_))
        ));
    }

    #[test]
    fn test_flipped_bit_invalid() {
        let (header, txids) = block_with(4);
        let mut block = MerkleBlock::from_txids(header, &txids, &[false, true, false, false]);
        block.tree.toggle_bit(0);
        assert!(MerkleProofVerifier::verify_block(&header, &block).is_err());
    }

    #[test]
    fn test_wire_encoding() {
        let (header, txids) = block_with(3);
        let block = MerkleBlock::from_txids(header, &txids, &[false, false, true]);
        let bytes = serialize(&block);
        let decoded: MerkleBlock = deserialize(&bytes).unwrap();
        assert_eq!(decoded.header, header);
        assert_eq!(
            MerkleProofVerifier::verify_block(&header, &decoded).unwrap().txids,
            vec![txids[2]]
        );
    }
}
