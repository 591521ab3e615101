//! Address decoding for the watch set
//!
//! Understands Base58Check P2PKH/P2SH addresses and bech32/bech32m segwit
//! addresses for a given network, and maps them to the output script and
//! bloom filter element they stand for.

use super::hash::double_sha256;
use crate::core::params::NetworkParams;
use bech32::{FromBase32, Variant};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while decoding an address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid base58 encoding")]
    InvalidBase58,
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid payload length {0}")]
    InvalidLength(usize),
    #[error("Version byte {0:#04x} does not belong to this network")]
    WrongNetwork(u8),
    #[error("Human readable part {0} does not belong to this network")]
    WrongHrp(String),
    #[error("Invalid bech32: {0}")]
    Bech32(String),
    #[error("Invalid witness version {0}")]
    InvalidWitnessVersion(u8),
    #[error("Invalid witness program length {0}")]
    InvalidWitnessProgram(usize),
}

impl From<bech32::Error> for AddressError {
    fn from(e: bech32::Error) -> Self {
        AddressError::Bech32(e.to_string())
    }
}

/// What an address commits to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Payload {
    PubkeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    WitnessProgram { version: u8, program: Vec<u8> },
}

/// A decoded address, remembering the text it was parsed from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    payload: Payload,
    encoded: String,
}

impl Address {
    /// Decode an address for the given network
    pub fn parse(s: &str, params: &NetworkParams) -> Result<Self, AddressError> {
        let s = s.trim();
        let lower = s.to_lowercase();
        let payload = if lower.starts_with(&format!("{}1", params.bech32_hrp)) {
            Self::decode_segwit(s, params)?
        } else {
            Self::decode_base58(s, params)?
        };

        let encoded = match payload {
            Payload::WitnessProgram { .. } => lower,
            _ => s.to_string(),
        };
        Ok(Self { payload, encoded })
    }

    fn decode_base58(s: &str, params: &NetworkParams) -> Result<Payload, AddressError> {
        let data = bs58::decode(s)
            .into_vec()
            .map_err(|_| AddressError::InvalidBase58)?;
        if data.len() != 25 {
            return Err(AddressError::InvalidLength(data.len()));
        }

        let (body, checksum) = data.split_at(21);
        if double_sha256(body)[..4] != *checksum {
            return Err(AddressError::InvalidChecksum);
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&body[1..]);
        match body[0] {
            v if v == params.p2pkh_prefix => Ok(Payload::PubkeyHash(hash)),
            v if v == params.p2sh_prefix => Ok(Payload::ScriptHash(hash)),
            v => Err(AddressError::WrongNetwork(v)),
        }
    }

    fn decode_segwit(s: &str, params: &NetworkParams) -> Result<Payload, AddressError> {
        let (hrp, data, variant) = bech32::decode(s)?;
        if hrp != params.bech32_hrp {
            return Err(AddressError::WrongHrp(hrp));
        }

        let (version, program) = data
            .split_first()
            .ok_or(AddressError::InvalidWitnessProgram(0))?;
        let version = version.to_u8();
        let program = Vec::<u8>::from_base32(program)?;

        if version > 16 {
            return Err(AddressError::InvalidWitnessVersion(version));
        }
        // BIP350: v0 uses bech32, everything later bech32m.
        let expected = if version == 0 {
            Variant::Bech32
        } else {
            Variant::Bech32m
        };
        if variant != expected {
            return Err(AddressError::Bech32(format!(
                "witness v{} requires {:?}",
                version, expected
            )));
        }
        if program.len() < 2 || program.len() > 40 {
            return Err(AddressError::InvalidWitnessProgram(program.len()));
        }
        if version == 0 && program.len() != 20 && program.len() != 32 {
            return Err(AddressError::InvalidWitnessProgram(program.len()));
        }

        Ok(Payload::WitnessProgram { version, program })
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The output script paying to this address
    pub fn script_pubkey(&self) -> Vec<u8> {
        match &self.payload {
            Payload::PubkeyHash(hash) => {
                let mut script = vec![0x76, 0xa9, 0x14];
                script.extend_from_slice(hash);
                script.extend_from_slice(&[0x88, 0xac]);
                script
            }
            Payload::ScriptHash(hash) => {
                let mut script = vec![0xa9, 0x14];
                script.extend_from_slice(hash);
                script.push(0x87);
                script
            }
            Payload::WitnessProgram { version, program } => {
                let op_version = if *version == 0 { 0x00 } else { 0x50 + version };
                let mut script = vec![op_version, program.len() as u8];
                script.extend_from_slice(program);
                script
            }
        }
    }

    /// The data push a matching output script carries; this is what goes
    /// into the bloom filter.
    pub fn filter_element(&self) -> &[u8] {
        match &self.payload {
            Payload::PubkeyHash(hash) | Payload::ScriptHash(hash) => hash,
            Payload::WitnessProgram { program, .. } => program,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::Network;

    #[test]
    fn test_mainnet_p2pkh() {
        let params = NetworkParams::new(Network::Main);
        let addr = Address::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", &params).unwrap();
        assert_eq!(
            hex::encode(addr.filter_element()),
            "62e907b15cbf27d5425399ebf6f0fb50ebb88f18"
        );
        assert_eq!(
            hex::encode(addr.script_pubkey()),
            "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac"
        );
    }

    #[test]
    fn test_testnet_addresses() {
        let params = NetworkParams::new(Network::Testnet);
        let p2pkh = Address::parse("mpXwg4jMtRhuSpVq4xS3HFHmCmWp9NyGKt", &params).unwrap();
        assert!(matches!(p2pkh.payload(), Payload::PubkeyHash(_)));

        let p2sh = Address::parse("2N2GDNJ4rEm6NxfMC9ck8VuRdheQzXWaNZv", &params).unwrap();
        assert!(matches!(p2sh.payload(), Payload::ScriptHash(_)));
        assert_eq!(p2sh.script_pubkey()[0], 0xa9);
    }

    #[test]
    fn test_wrong_network_rejected() {
        let params = NetworkParams::new(Network::Testnet);
        assert_eq!(
            Address::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", &params),
            Err(AddressError::WrongNetwork(0x00))
        );
    }

    #[test]
    fn test_bad_checksum() {
        let params = NetworkParams::new(Network::Main);
        assert_eq!(
            Address::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb", &params),
            Err(AddressError::InvalidChecksum)
        );
    }

    #[test]
    fn test_segwit_v0() {
        let params = NetworkParams::new(Network::Main);
        let addr = Address::parse("BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4", &params).unwrap();
        assert_eq!(
            hex::encode(addr.script_pubkey()),
            "0014751e76e8199196d454941c45d1b3a323f1433bd6"
        );
        assert_eq!(addr.to_string(), "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");

        let testnet = NetworkParams::new(Network::Testnet);
        let addr = Address::parse("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx", &testnet).unwrap();
        assert_eq!(
            hex::encode(addr.filter_element()),
            "751e76e8199196d454941c45d1b3a323f1433bd6"
        );
    }
}
