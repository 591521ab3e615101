//! Script inspection
//!
//! An SPV client never executes scripts. It only walks their data pushes
//! (for bloom filter matching) and recognises the standard output shapes.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// Iterator over the data pushes of a script.
///
/// Non-push opcodes are skipped. Iteration ends at the first truncated
/// push, the same way script parsing gives up on malformed input.
pub struct PushData<'a> {
    script: &'a [u8],
}

pub fn push_data(script: &[u8]) -> PushData<'_> {
    PushData { script }
}

impl<'a> PushData<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.script.len() < n {
            self.script = &[];
            return None;
        }
        let (head, rest) = self.script.split_at(n);
        self.script = rest;
        Some(head)
    }

    fn take_len(&mut self, width: usize) -> Option<usize> {
        let bytes = self.take(width)?;
        Some(
            bytes
                .iter()
                .rev()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize),
        )
    }
}

impl<'a> Iterator for PushData<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (&opcode, rest) = self.script.split_first()?;
            self.script = rest;

            let len = match opcode {
                0x01..=0x4b => opcode as usize,
                OP_PUSHDATA1 => self.take_len(1)?,
                OP_PUSHDATA2 => self.take_len(2)?,
                OP_PUSHDATA4 => self.take_len(4)?,
                _ => continue,
            };
            return self.take(len);
        }
    }
}

/// Standard output script shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    WitnessPubKeyHash,
    WitnessScriptHash,
    Taproot,
    WitnessUnknown,
    NullData,
    NonStandard,
}

impl ScriptType {
    pub fn classify(script: &[u8]) -> Self {
        match script {
            [OP_DUP, OP_HASH160, 0x14, .., OP_EQUALVERIFY, OP_CHECKSIG] if script.len() == 25 => {
                ScriptType::PubKeyHash
            }
            [OP_HASH160, 0x14, .., OP_EQUAL] if script.len() == 23 => ScriptType::ScriptHash,
            [OP_0, 0x14, ..] if script.len() == 22 => ScriptType::WitnessPubKeyHash,
            [OP_0, 0x20, ..] if script.len() == 34 => ScriptType::WitnessScriptHash,
            [OP_1, 0x20, ..] if script.len() == 34 => ScriptType::Taproot,
            [version, len, ..]
                if (OP_1..=OP_16).contains(version)
                    && (2..=40).contains(len)
                    && script.len() == *len as usize + 2 =>
            {
                ScriptType::WitnessUnknown
            }
            [len @ (33 | 65), .., OP_CHECKSIG] if script.len() == *len as usize + 2 => {
                ScriptType::PubKey
            }
            [m, .., n, OP_CHECKMULTISIG]
                if (OP_1..=OP_16).contains(m) && (OP_1..=OP_16).contains(n) && m <= n =>
            {
                ScriptType::Multisig
            }
            [OP_RETURN, ..] => ScriptType::NullData,
            _ => ScriptType::NonStandard,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptType::PubKey => "pubkey",
            ScriptType::PubKeyHash => "pubkeyhash",
            ScriptType::ScriptHash => "scripthash",
            ScriptType::Multisig => "multisig",
            ScriptType::WitnessPubKeyHash => "witness_v0_keyhash",
            ScriptType::WitnessScriptHash => "witness_v0_scripthash",
            ScriptType::Taproot => "witness_v1_taproot",
            ScriptType::WitnessUnknown => "witness_unknown",
            ScriptType::NullData => "nulldata",
            ScriptType::NonStandard => "nonstandard",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p2pkh_pushes() {
        let script =
            hex::decode("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac").unwrap();
        let pushes: Vec<&[u8]> = push_data(&script).collect();
        assert_eq!(pushes.len(), 1);
        assert_eq!(hex::encode(pushes[0]), "62e907b15cbf27d5425399ebf6f0fb50ebb88f18");
        assert_eq!(ScriptType::classify(&script), ScriptType::PubKeyHash);
    }

    #[test]
    fn test_pushdata_variants() {
        let mut script = vec![OP_PUSHDATA1, 3, 1, 2, 3, OP_DUP, OP_PUSHDATA2, 2, 0, 9, 9];
        script.extend_from_slice(&[OP_PUSHDATA4, 1, 0, 0, 0, 7]);
        let pushes: Vec<&[u8]> = push_data(&script).collect();
        assert_eq!(pushes, vec![&[1u8, 2, 3][..], &[9, 9][..], &[7][..]]);
    }

    #[test]
    fn test_truncated_push_stops() {
        let script = [0x02, 0xaa, 0x05, 0x01];
        let pushes: Vec<&[u8]> = push_data(&script).collect();
        assert_eq!(pushes, vec![&[0xaau8, 0x05][..]]);

        let script = [0x05, 0x01];
        assert_eq!(push_data(&script).count(), 0);
    }

    #[test]
    fn test_classify_witness() {
        let mut v0 = vec![OP_0, 0x14];
        v0.extend_from_slice(&[0u8; 20]);
        assert_eq!(ScriptType::classify(&v0), ScriptType::WitnessPubKeyHash);

        let mut taproot = vec![OP_1, 0x20];
        taproot.extend_from_slice(&[0u8; 32]);
        assert_eq!(ScriptType::classify(&taproot), ScriptType::Taproot);

        assert_eq!(ScriptType::classify(&[OP_RETURN, 0x01, 0xff]), ScriptType::NullData);
        assert_eq!(ScriptType::classify(&[]), ScriptType::NonStandard);
    }
}
