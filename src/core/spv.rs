//! SPV (Simplified Payment Verification) Support
//!
//! - Bloom filters for transaction matching (BIP 37)
//! - The watch set of addresses, scripts and outpoints the filter is built from

use crate::core::params::NetworkParams;
use crate::core::script::push_data;
use crate::core::transaction::{OutPoint, Transaction};
use crate::crypto::address::{Address, AddressError};
use crate::crypto::murmur::murmur3;
use crate::crypto::Hash256;
use crate::encode::{read_var_bytes, serialize, write_var_bytes, Decodable, Encodable, EncodeError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::f64::consts::LN_2;
use std::fmt;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum bloom filter size in bytes
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions
pub const MAX_HASH_FUNCS: u32 = 50;

/// Default false-positive rate for filters sent to peers
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.0001;

/// Multiplier separating the seeds of successive hash functions
const SEED_MULTIPLIER: u32 = 0xFBA4C795;

/// Bloom filter errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BloomError {
    #[error("False positive rate {0} must be between 0 and 1")]
    InvalidFalsePositiveRate(f64),
    #[error("Filter of {0} bytes exceeds the maximum")]
    FilterTooLarge(usize),
    #[error("{0} hash functions exceeds the maximum")]
    TooManyHashFuncs(u32),
    #[error("Unknown update flags {0}")]
    UnknownFlags(u8),
}

/// How a peer should update its copy of the filter when outputs match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BloomFlags {
    /// Never update
    #[default]
    None = 0,
    /// Add the outpoint of every matching output
    All = 1,
    /// Only add outpoints of pay-to-pubkey and multisig outputs
    PubkeyOnly = 2,
}

impl TryFrom<u8> for BloomFlags {
    type Error = BloomError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BloomFlags::None),
            1 => Ok(BloomFlags::All),
            2 => Ok(BloomFlags::PubkeyOnly),
            other => Err(BloomError::UnknownFlags(other)),
        }
    }
}

impl std::str::FromStr for BloomFlags {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BloomFlags::None),
            "all" => Ok(BloomFlags::All),
            "pubkey_only" | "pubkey-only" => Ok(BloomFlags::PubkeyOnly),
            other => Err(format!("unknown bloom flags: {}", other)),
        }
    }
}

// =============================================================================
// Bloom Filter (BIP 37)
// =============================================================================

/// Bloom filter for address/transaction matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
    /// Update flags
    flags: BloomFlags,
}

impl BloomFilter {
    /// Create an empty filter sized for `elements` insertions at `fp_rate`
    pub fn new(
        elements: usize,
        fp_rate: f64,
        tweak: u32,
        flags: BloomFlags,
    ) -> Result<Self, BloomError> {
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(BloomError::InvalidFalsePositiveRate(fp_rate));
        }
        let elements = elements.max(1) as f64;

        // Optimal size: -1 / ln(2)^2 * n * ln(p)
        let size_bits = (-1.0 / (LN_2 * LN_2) * elements * fp_rate.ln()) as usize;
        let size_bytes = (size_bits.min(MAX_BLOOM_FILTER_SIZE * 8) / 8).max(1);

        // Optimal hash functions: (m / n) * ln(2)
        let hash_funcs = ((size_bytes * 8) as f64 / elements * LN_2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_HASH_FUNCS);

        Ok(Self {
            data: vec![0u8; size_bytes],
            hash_funcs,
            tweak,
            flags,
        })
    }

    /// Build a filter containing every element of `items`
    pub fn build<I, T>(items: I, fp_rate: f64, tweak: u32, flags: BloomFlags) -> Result<Self, BloomError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let items: Vec<T> = items.into_iter().collect();
        let mut filter = Self::new(items.len(), fp_rate, tweak, flags)?;
        for item in &items {
            filter.insert(item.as_ref());
        }
        Ok(filter)
    }

    /// Reassemble a filter received on the wire, enforcing protocol limits
    pub fn from_parts(
        data: Vec<u8>,
        hash_funcs: u32,
        tweak: u32,
        flags: u8,
    ) -> Result<Self, BloomError> {
        if data.len() > MAX_BLOOM_FILTER_SIZE {
            return Err(BloomError::FilterTooLarge(data.len()));
        }
        if hash_funcs > MAX_HASH_FUNCS {
            return Err(BloomError::TooManyHashFuncs(hash_funcs));
        }
        Ok(Self {
            data,
            hash_funcs,
            tweak,
            flags: BloomFlags::try_from(flags)?,
        })
    }

    /// Add data to the filter
    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for i in 0..self.hash_funcs {
            let idx = self.bit_index(data, i);
            self.data[idx >> 3] |= 1 << (idx & 7);
        }
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|i| {
            let idx = self.bit_index(data, i);
            self.data[idx >> 3] & (1 << (idx & 7)) != 0
        })
    }

    /// Check if a transaction matches the filter: its txid, any data push
    /// in its outputs, any spent outpoint or any data push in its inputs.
    pub fn matches_transaction(&self, tx: &Transaction) -> bool {
        if self.contains(tx.txid().as_bytes()) {
            return true;
        }

        let output_match = tx.outputs.iter().any(|output| {
            push_data(&output.script_pubkey).any(|push| !push.is_empty() && self.contains(push))
        });
        if output_match {
            return true;
        }

        tx.inputs.iter().any(|input| {
            self.contains(&serialize(&input.previous_output))
                || push_data(&input.script_sig).any(|push| !push.is_empty() && self.contains(push))
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get filter size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> BloomFlags {
        self.flags
    }

    /// Check if no bit is set
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    fn bit_index(&self, data: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(data, seed) as usize % (self.data.len() * 8)
    }
}

impl Encodable for BloomFilter {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        write_var_bytes(buf, &self.data);
        self.hash_funcs.consensus_encode(buf);
        self.tweak.consensus_encode(buf);
        (self.flags as u8).consensus_encode(buf);
    }
}

impl Decodable for BloomFilter {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let data = read_var_bytes(buf)?;
        let hash_funcs = u32::consensus_decode(buf)?;
        let tweak = u32::consensus_decode(buf)?;
        let flags = u8::consensus_decode(buf)?;
        Self::from_parts(data, hash_funcs, tweak, flags)
            .map_err(|_| EncodeError::ParseFailed("filterload outside protocol limits"))
    }
}

// =============================================================================
// Watch Set
// =============================================================================

/// Something the client wants to hear about
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchedItem {
    /// Outputs paying to an address
    Address(Address),
    /// Outputs or inputs carrying this exact data push
    Script(Vec<u8>),
    /// Transactions spending this output
    Outpoint(OutPoint),
}

impl WatchedItem {
    /// Parse an address, a `txid:vout` outpoint, or a hex data push
    pub fn parse(s: &str, params: &NetworkParams) -> Result<Self, AddressError> {
        let s = s.trim();
        if let Some((txid, vout)) = s.split_once(':') {
            if let (Ok(txid), Ok(vout)) = (txid.parse::<Hash256>(), vout.parse::<u32>()) {
                return Ok(WatchedItem::Outpoint(OutPoint::new(txid, vout)));
            }
        }

        match Address::parse(s, params) {
            Ok(address) => Ok(WatchedItem::Address(address)),
            Err(e) => match hex::decode(s) {
                Ok(script) if !script.is_empty() => Ok(WatchedItem::Script(script)),
                _ => Err(e),
            },
        }
    }

    /// The bytes this item contributes to the bloom filter
    pub fn filter_element(&self) -> Vec<u8> {
        match self {
            WatchedItem::Address(address) => address.filter_element().to_vec(),
            WatchedItem::Script(script) => script.clone(),
            WatchedItem::Outpoint(outpoint) => serialize(outpoint),
        }
    }
}

impl fmt::Display for WatchedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchedItem::Address(address) => write!(f, "{}", address),
            WatchedItem::Script(script) => write!(f, "{}", hex::encode(script)),
            WatchedItem::Outpoint(outpoint) => write!(f, "{}", outpoint),
        }
    }
}

/// The set of watched items and the bloom filter derived from it.
///
/// The filter is rebuilt from scratch after every effective change, never
/// patched in place.
#[derive(Debug, Clone)]
pub struct AddressWatchSet {
    items: BTreeSet<WatchedItem>,
    fp_rate: f64,
    tweak: u32,
    flags: BloomFlags,
    /// Bumped on every effective mutation
    revision: u64,
    filter: Option<BloomFilter>,
}

impl AddressWatchSet {
    pub fn new(fp_rate: f64, flags: BloomFlags) -> Self {
        Self::with_tweak(fp_rate, flags, rand::random())
    }

    pub fn with_tweak(fp_rate: f64, flags: BloomFlags, tweak: u32) -> Self {
        Self {
            items: BTreeSet::new(),
            fp_rate,
            tweak,
            flags,
            revision: 0,
            filter: None,
        }
    }

    /// Add an item; returns false if it was already watched
    pub fn add(&mut self, item: WatchedItem) -> bool {
        let inserted = self.items.insert(item);
        if inserted {
            self.invalidate();
        }
        inserted
    }

    /// Remove an item; returns false if it was not watched
    pub fn remove(&mut self, item: &WatchedItem) -> bool {
        let removed = self.items.remove(item);
        if removed {
            self.invalidate();
        }
        removed
    }

    pub fn contains(&self, item: &WatchedItem) -> bool {
        self.items.contains(item)
    }

    /// Current items in a stable order
    pub fn snapshot(&self) -> Vec<WatchedItem> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the cached filter is out of date
    pub fn is_stale(&self) -> bool {
        self.filter.is_none()
    }

    /// The filter for the current items, rebuilding it if needed
    pub fn filter(&mut self) -> Result<BloomFilter, BloomError> {
        if let Some(filter) = &self.filter {
            return Ok(filter.clone());
        }

        let filter = BloomFilter::build(
            self.items.iter().map(WatchedItem::filter_element),
            self.fp_rate,
            self.tweak,
            self.flags,
        )?;
        log::debug!(
            "Rebuilt bloom filter: {} items, {} bytes, {} hash functions",
            self.items.len(),
            filter.size(),
            filter.hash_funcs()
        );
        self.filter = Some(filter.clone());
        Ok(filter)
    }

    fn invalidate(&mut self) {
        self.revision += 1;
        self.filter = None;
    }
}
