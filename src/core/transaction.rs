//! Transaction parsing
//!
//! Transactions are decoded only far enough to compute their txid and to
//! test them against a bloom filter. Segregated witness serialization is
//! understood; the txid always covers the witness-stripped form.

use super::block::Txid;
use crate::crypto::Hash256;
use crate::encode::{
    read_compact_size, read_length, read_list, read_var_bytes, write_compact_size, write_list,
    write_var_bytes, Decodable, Encodable, EncodeError, MAX_VEC_SIZE,
};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

/// Segwit marker and flag bytes following the version
const WITNESS_MARKER: u8 = 0x00;
const WITNESS_FLAG: u8 = 0x01;

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The previous-output reference of a coinbase input
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.txid.consensus_encode(buf);
        self.vout.consensus_encode(buf);
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            txid: Decodable::consensus_decode(buf)?,
            vout: Decodable::consensus_decode(buf)?,
        })
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    #[serde(with = "hex_bytes")]
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack; empty for legacy inputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub witness: Vec<Vec<u8>>,
}

impl Encodable for TxIn {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.previous_output.consensus_encode(buf);
        write_var_bytes(buf, &self.script_sig);
        self.sequence.consensus_encode(buf);
    }
}

impl Decodable for TxIn {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            previous_output: Decodable::consensus_decode(buf)?,
            script_sig: read_var_bytes(buf)?,
            sequence: Decodable::consensus_decode(buf)?,
            witness: Vec::new(),
        })
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Amount in satoshis
    pub value: u64,
    #[serde(with = "hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.value.consensus_encode(buf);
        write_var_bytes(buf, &self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            value: Decodable::consensus_decode(buf)?,
            script_pubkey: read_var_bytes(buf)?,
        })
    }
}

/// A parsed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Hash of the witness-stripped serialization
    pub fn txid(&self) -> Txid {
        let mut data = Vec::new();
        self.encode_legacy(&mut data);
        Hash256::hash(&data)
    }

    /// Hash of the full serialization including witnesses
    pub fn wtxid(&self) -> Hash256 {
        let mut data = Vec::new();
        self.consensus_encode(&mut data);
        Hash256::hash(&data)
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of all output values
    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    fn encode_legacy<B: BufMut>(&self, buf: &mut B) {
        self.version.consensus_encode(buf);
        write_list(buf, &self.inputs);
        write_list(buf, &self.outputs);
        self.lock_time.consensus_encode(buf);
    }
}

impl Encodable for Transaction {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        if !self.has_witness() {
            return self.encode_legacy(buf);
        }

        self.version.consensus_encode(buf);
        buf.put_u8(WITNESS_MARKER);
        buf.put_u8(WITNESS_FLAG);
        write_list(buf, &self.inputs);
        write_list(buf, &self.outputs);
        for input in &self.inputs {
            write_compact_size(buf, input.witness.len() as u64);
            for item in &input.witness {
                write_var_bytes(buf, item);
            }
        }
        self.lock_time.consensus_encode(buf);
    }
}

impl Decodable for Transaction {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let version = i32::consensus_decode(buf)?;

        let mut input_count = read_length(buf, MAX_VEC_SIZE)?;
        let mut segwit = false;
        if input_count == 0 {
            // Either the segwit marker or a transaction with no inputs
            let flag = u8::consensus_decode(buf)?;
            if flag != WITNESS_FLAG {
                return Err(EncodeError::ParseFailed("unknown witness flag"));
            }
            segwit = true;
            input_count = read_length(buf, MAX_VEC_SIZE)?;
        }

        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxIn::consensus_decode(buf)?);
        }
        let outputs: Vec<TxOut> = read_list(buf, MAX_VEC_SIZE)?;

        if segwit {
            for input in &mut inputs {
                let items = read_compact_size(buf)?;
                if items > MAX_VEC_SIZE {
                    return Err(EncodeError::OversizedVec {
                        requested: items,
                        max: MAX_VEC_SIZE,
                    });
                }
                for _ in 0..items {
                    input.witness.push(read_var_bytes(buf)?);
                }
            }
            if inputs.iter().all(|input| input.witness.is_empty()) {
                return Err(EncodeError::ParseFailed("superfluous witness record"));
            }
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time: Decodable::consensus_decode(buf)?,
        })
    }
}

/// Serde helper storing script bytes as hex strings
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{deserialize, serialize};

    const GENESIS_COINBASE: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

    fn sample_segwit_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxIn {
                previous_output: OutPoint::new(Hash256::hash(b"prev"), 1),
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
                witness: vec![vec![0x30; 71], vec![0x02; 33]],
            }],
            outputs: vec![TxOut {
                value: 50_000,
                script_pubkey: hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6")
                    .unwrap(),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_genesis_coinbase() {
        let raw = hex::decode(GENESIS_COINBASE).unwrap();
        let tx: Transaction = deserialize(&raw).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.total_output(), 50 * 100_000_000);
        assert_eq!(
            tx.txid().to_string(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(serialize(&tx), raw);
    }

    #[test]
    fn test_segwit_txid_strips_witness() {
        let tx = sample_segwit_tx();
        let raw = serialize(&tx);
        assert_eq!(&raw[4..6], &[WITNESS_MARKER, WITNESS_FLAG]);

        let parsed: Transaction = deserialize(&raw).unwrap();
        assert_eq!(parsed, tx);
        assert_ne!(parsed.txid(), parsed.wtxid());

        let mut stripped = tx.clone();
        stripped.inputs[0].witness.clear();
        assert_eq!(stripped.txid(), tx.txid());
        assert_eq!(stripped.wtxid(), tx.txid());
    }

    #[test]
    fn test_bad_witness_flag() {
        let mut raw = serialize(&sample_segwit_tx());
        raw[5] = 0x02;
        assert_eq!(
            deserialize::<Transaction>(&raw),
            Err(EncodeError::ParseFailed("unknown witness flag"))
        );
    }

    #[test]
    fn test_truncated_transaction() {
        let raw = hex::decode(GENESIS_COINBASE).unwrap();
        assert!(deserialize::<Transaction>(&raw[..raw.len() - 2]).is_err());
    }
}
