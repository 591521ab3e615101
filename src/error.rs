//! Top-level error taxonomy
//!
//! Module errors fold into four kinds that decide what happens to a peer:
//! transport trouble is retried, protocol violations and forged proofs get
//! the peer banned for the session, and chain inconsistencies only discard
//! the offending data.

use crate::core::{BloomError, ChainError};
use crate::crypto::{AddressError, MerkleError};
use crate::encode::EncodeError;
use crate::network::{PeerError, PeerId};
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpvError {
    #[error("Transport error: {0}")]
    TransportError(PeerError),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(PeerError),
    #[error("Proof verification failed: {0}")]
    ProofVerificationFailure(#[from] MerkleError),
    #[error("Chain inconsistency: {0}")]
    ChainInconsistency(#[from] ChainError),
    #[error("Bloom filter error: {0}")]
    Bloom(#[from] BloomError),
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Cannot resolve peer address {0}")]
    Resolve(String),
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Node is not running")]
    NotRunning,
    #[error("Node is already running")]
    AlreadyRunning,
}

impl From<PeerError> for SpvError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::InvalidProof(e) => SpvError::ProofVerificationFailure(e),
            e if e.is_misbehavior() => SpvError::ProtocolViolation(e),
            e => SpvError::TransportError(e),
        }
    }
}

impl SpvError {
    /// Whether the peer that caused this should be banned
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            SpvError::ProtocolViolation(_) | SpvError::ProofVerificationFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash256;

    #[test]
    fn test_peer_errors_classified() {
        let err: SpvError = PeerError::Violation("early tx".into()).into();
        assert!(matches!(err, SpvError::ProtocolViolation(_)));
        assert!(err.is_peer_fault());

        let err: SpvError = PeerError::Timeout("handshake").into();
        assert!(matches!(err, SpvError::TransportError(_)));
        assert!(!err.is_peer_fault());

        let err: SpvError = PeerError::InvalidProof(MerkleError::NoTransactions).into();
        assert!(matches!(err, SpvError::ProofVerificationFailure(_)));
        assert!(err.is_peer_fault());
    }

    #[test]
    fn test_chain_errors_are_not_peer_faults() {
        let err: SpvError = ChainError::UnknownParent(Hash256::ZERO).into();
        assert!(!err.is_peer_fault());
        assert!(err.to_string().starts_with("Chain inconsistency"));
    }
}
