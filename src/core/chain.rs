//! Header chain management
//!
//! Tracks every validated header, the currently active (most-work) chain
//! and the side branches competing with it. Reorganizations happen only
//! when a branch has strictly more cumulative work than the active tip and
//! forks off no deeper than `max_reorg_depth` below it.

use super::block::{BlockError, BlockHash, BlockHeader};
use super::params::NetworkParams;
use chrono::Utc;
use primitive_types::U256;
use std::collections::HashMap;
use thiserror::Error;

/// Number of blocks to use for Median Time Past calculation
pub const MTP_BLOCK_COUNT: usize = 11;

/// Maximum allowed time drift into the future (2 hours in seconds)
pub const MAX_FUTURE_BLOCK_TIME: i64 = 7200;

/// Default bound on how far back a reorganization may fork
pub const DEFAULT_MAX_REORG_DEPTH: u32 = 100;

/// Reasons a header is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Previous block {0} is unknown")]
    UnknownParent(BlockHash),
    #[error("Block {0} is not on the active chain")]
    UnknownBlock(BlockHash),
    #[error(transparent)]
    ProofOfWork(#[from] BlockError),
    #[error("Timestamp {time} is not after median time past {median}")]
    TimeTooOld { time: u32, median: u32 },
    #[error("Timestamp {time} is more than two hours ahead of {now}")]
    TimeTooNew { time: u32, now: i64 },
    #[error("Fork at height {fork_height} is deeper than {max_depth} below tip {tip_height}")]
    ForkTooDeep {
        fork_height: u32,
        tip_height: u32,
        max_depth: u32,
    },
}

/// A validated header with its position and cumulative work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub header: BlockHeader,
    pub hash: BlockHash,
    pub height: u32,
    pub chain_work: U256,
}

/// Result of offering a header to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Header was already known (active chain or side branch)
    AlreadyKnown,
    /// Header extended the active tip
    Accepted { height: u32 },
    /// Header was stored on a branch with no more work than the tip
    SideBranch { height: u32 },
    /// Header's branch overtook the active chain
    Reorganized {
        fork_height: u32,
        disconnected: Vec<BlockHash>,
        connected: Vec<BlockHash>,
    },
}

/// Validated block headers forming the best chain plus side branches
#[derive(Debug, Clone)]
pub struct HeaderChain {
    params: NetworkParams,
    /// Every known header by hash
    entries: HashMap<BlockHash, ChainEntry>,
    /// Active chain, indexed by height
    active: Vec<BlockHash>,
    max_reorg_depth: u32,
}

impl HeaderChain {
    /// Create a chain containing only the network's genesis header
    pub fn new(params: NetworkParams, max_reorg_depth: u32) -> Self {
        let genesis = params.genesis_header();
        let hash = genesis.block_hash();
        let entry = ChainEntry {
            header: genesis,
            hash,
            height: 0,
            chain_work: genesis.work(),
        };

        let mut entries = HashMap::new();
        entries.insert(hash, entry);
        Self {
            params,
            entries,
            active: vec![hash],
            max_reorg_depth,
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Height of the active tip
    pub fn height(&self) -> u32 {
        (self.active.len() - 1) as u32
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.active[self.active.len() - 1]
    }

    pub fn tip(&self) -> &ChainEntry {
        &self.entries[&self.tip_hash()]
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.active[0]
    }

    /// Cumulative work of the active chain
    pub fn total_work(&self) -> U256 {
        self.tip().chain_work
    }

    /// Any known header, active or side branch
    pub fn get(&self, hash: &BlockHash) -> Option<&ChainEntry> {
        self.entries.get(hash)
    }

    /// Whether the header is part of the active chain
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.entries
            .get(hash)
            .map(|entry| self.active.get(entry.height as usize) == Some(hash))
            .unwrap_or(false)
    }

    /// Height of a header on the active chain
    pub fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        if self.contains(hash) {
            self.entries.get(hash).map(|entry| entry.height)
        } else {
            None
        }
    }

    pub fn header_at(&self, height: u32) -> Option<&BlockHeader> {
        self.active
            .get(height as usize)
            .and_then(|hash| self.entries.get(hash))
            .map(|entry| &entry.header)
    }

    /// Active chain headers from genesis to tip
    pub fn active_headers(&self) -> impl Iterator<Item = &BlockHeader> + '_ {
        self.active.iter().map(move |hash| &self.entries[hash].header)
    }

    /// Known headers that are not on the active chain
    pub fn side_branch_count(&self) -> usize {
        self.entries.len() - self.active.len()
    }

    /// Median timestamp of up to 11 headers ending at `hash`
    pub fn median_time_past(&self, hash: &BlockHash) -> u32 {
        let mut times = Vec::with_capacity(MTP_BLOCK_COUNT);
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            times.push(entry.header.time);
            if times.len() == MTP_BLOCK_COUNT || entry.height == 0 {
                break;
            }
            cursor = self.entries.get(&entry.header.prev_blockhash);
        }

        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Block locator for `getheaders`: the last ten hashes, then
    /// exponentially sparser ones back to genesis.
    pub fn locator(&self) -> Vec<BlockHash> {
        let mut hashes = Vec::new();
        let mut height = self.height() as i64;
        let mut step = 1i64;

        while height > 0 {
            hashes.push(self.active[height as usize]);
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(self.genesis_hash());
        hashes
    }

    /// Validate and insert a header using the current wall-clock time
    pub fn try_append(&mut self, header: BlockHeader) -> Result<AppendOutcome, ChainError> {
        self.try_append_at(header, Utc::now().timestamp())
    }

    /// Validate and insert a header as if the current time were `now`
    pub fn try_append_at(
        &mut self,
        header: BlockHeader,
        now: i64,
    ) -> Result<AppendOutcome, ChainError> {
        let hash = header.block_hash();
        if self.entries.contains_key(&hash) {
            return Ok(AppendOutcome::AlreadyKnown);
        }

        let parent = self
            .entries
            .get(&header.prev_blockhash)
            .copied()
            .ok_or(ChainError::UnknownParent(header.prev_blockhash))?;

        let extends_tip = parent.hash == self.tip_hash();
        let fork_height = if extends_tip {
            parent.height
        } else {
            self.fork_point(&parent)
        };
        let tip_height = self.height();
        if tip_height - fork_height > self.max_reorg_depth {
            return Err(ChainError::ForkTooDeep {
                fork_height,
                tip_height,
                max_depth: self.max_reorg_depth,
            });
        }

        header.validate_pow(self.params.pow_limit())?;

        let median = self.median_time_past(&parent.hash);
        if header.time <= median {
            return Err(ChainError::TimeTooOld {
                time: header.time,
                median,
            });
        }
        if header.time as i64 > now + MAX_FUTURE_BLOCK_TIME {
            return Err(ChainError::TimeTooNew {
                time: header.time,
                now,
            });
        }

        let entry = ChainEntry {
            header,
            hash,
            height: parent.height + 1,
            chain_work: parent.chain_work.saturating_add(header.work()),
        };
        let height = entry.height;
        let chain_work = entry.chain_work;
        self.entries.insert(hash, entry);

        if extends_tip {
            self.active.push(hash);
            return Ok(AppendOutcome::Accepted { height });
        }

        // Equal work keeps the first-seen chain
        if chain_work <= self.total_work() {
            return Ok(AppendOutcome::SideBranch { height });
        }

        Ok(self.reorganize(hash, fork_height))
    }

    /// Height of the last active-chain ancestor of `entry`
    fn fork_point(&self, entry: &ChainEntry) -> u32 {
        let mut cursor = entry;
        while !self.contains(&cursor.hash) {
            match self.entries.get(&cursor.header.prev_blockhash) {
                Some(parent) => cursor = parent,
                None => return 0,
            }
        }
        cursor.height
    }

    fn reorganize(&mut self, new_tip: BlockHash, fork_height: u32) -> AppendOutcome {
        let mut connected = Vec::new();
        let mut cursor = new_tip;
        while let Some(entry) = self.entries.get(&cursor) {
            if entry.height <= fork_height {
                break;
            }
            connected.push(cursor);
            cursor = entry.header.prev_blockhash;
        }
        connected.reverse();

        // The divergent suffix stays in `entries` as a side branch
        let disconnected = self.active.split_off(fork_height as usize + 1);
        self.active.extend_from_slice(&connected);

        log::info!(
            "Chain reorganized at height {}: {} disconnected, {} connected, new tip {}",
            fork_height,
            disconnected.len(),
            connected.len(),
            new_tip
        );

        AppendOutcome::Reorganized {
            fork_height,
            disconnected,
            connected,
        }
    }

    /// Replay previously stored headers on top of genesis. Stops at the
    /// first header that no longer validates and returns how many were
    /// applied.
    pub fn restore<'a, I>(&mut self, headers: I) -> usize
    where
        I: IntoIterator<Item = &'a BlockHeader>,
    {
        let mut applied = 0;
        for header in headers {
            if header.block_hash() == self.genesis_hash() {
                continue;
            }
            match self.try_append(*header) {
                Ok(AppendOutcome::AlreadyKnown) => {}
                Ok(_) => applied += 1,
                Err(e) => {
                    log::warn!("Stopped restoring headers at {}: {}", header.block_hash(), e);
                    break;
                }
            }
        }
        applied
    }
}


#[cfg(test)]
mod tests {
    use super::testing::child;
    use super::*;
    use crate::core::params::Network;

    const NOW: i64 = 2_000_000_000;

    fn regtest_chain() -> HeaderChain {
        HeaderChain::new(NetworkParams::new(Network::Regtest), DEFAULT_MAX_REORG_DEPTH)
    }

    #[test]
    fn test_new_chain_has_genesis() {
        let chain = regtest_chain();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip_hash(), chain.params().genesis_header().block_hash());
        assert_eq!(chain.locator(), vec![chain.genesis_hash()]);
    }

    #[test]
    fn test_accepted_extends_tip_by_one() {
        let mut chain = regtest_chain();
        let genesis = *chain.tip();
        let header = child(&genesis.header, 1);

        let outcome = chain.try_append_at(header, NOW).unwrap();
        assert_eq!(outcome, AppendOutcome::Accepted { height: 1 });
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip().header.prev_blockhash, genesis.hash);
        assert_eq!(chain.height_of(&header.block_hash()), Some(1));
        assert_eq!(chain.total_work(), U256::from(4));
    }

    #[test]
    fn test_duplicate_is_already_known() {
        let mut chain = regtest_chain();
        let header = child(&chain.tip().header, 1);
        chain.try_append_at(header, NOW).unwrap();
        assert_eq!(chain.try_append_at(header, NOW), Ok(AppendOutcome::AlreadyKnown));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut chain = regtest_chain();
        let mut header = child(&chain.tip().header, 1);
        header.prev_blockhash = crate::crypto::Hash256::hash(b"nowhere");
        assert!(matches!(
            chain.try_append_at(header, NOW),
            Err(ChainError::UnknownParent(_))
        ));
    }

    #[test]
    fn test_bad_pow_rejected() {
        let mut chain = regtest_chain();
        let mut header = child(&chain.tip().header, 1);
        // Regtest targets accept about half of all hashes; find a failing nonce.
        let limit = chain.params().pow_limit();
        while header.validate_pow(limit).is_ok() {
            header.nonce += 1;
        }
        assert!(matches!(
            chain.try_append_at(header, NOW),
            Err(ChainError::ProofOfWork(_))
        ));
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn test_timestamp_rules() {
        let mut chain = regtest_chain();
        let genesis = chain.tip().header;

        let mut old = genesis;
        old.prev_blockhash = genesis.block_hash();
        old.time = genesis.time;
        let old = testing::mine(old);
        assert!(matches!(
            chain.try_append_at(old, NOW),
            Err(ChainError::TimeTooOld { .. })
        ));

        let header = child(&genesis, 1);
        let now = header.time as i64 - MAX_FUTURE_BLOCK_TIME - 1;
        assert!(matches!(
            chain.try_append_at(header, now),
            Err(ChainError::TimeTooNew { .. })
        ));
    }

    #[test]
    fn test_equal_work_first_seen_wins() {
        let mut chain = regtest_chain();
        let genesis = chain.tip().header;
        let first = child(&genesis, 1);
        let second = child(&genesis, 2);

        chain.try_append_at(first, NOW).unwrap();
        let outcome = chain.try_append_at(second, NOW).unwrap();
        assert_eq!(outcome, AppendOutcome::SideBranch { height: 1 });
        assert_eq!(chain.tip_hash(), first.block_hash());
        assert!(chain.get(&second.block_hash()).is_some());
        assert!(!chain.contains(&second.block_hash()));
    }

    #[test]
    fn test_reorg_to_more_work() {
        let mut chain = regtest_chain();
        let a = chain.tip().header;
        let b = child(&a, 1);
        let c = child(&b, 1);
        chain.try_append_at(b, NOW).unwrap();
        chain.try_append_at(c, NOW).unwrap();

        let b2 = child(&a, 2);
        let c2 = child(&b2, 2);
        let d2 = child(&c2, 2);
        assert!(matches!(
            chain.try_append_at(b2, NOW),
            Ok(AppendOutcome::SideBranch { height: 1 })
        ));
        assert!(matches!(
            chain.try_append_at(c2, NOW),
            Ok(AppendOutcome::SideBranch { height: 2 })
        ));

        match chain.try_append_at(d2, NOW).unwrap() {
            AppendOutcome::Reorganized {
                fork_height,
                disconnected,
                connected,
            } => {
                assert_eq!(fork_height, 0);
                assert_eq!(disconnected, vec![b.block_hash(), c.block_hash()]);
                assert_eq!(
                    connected,
                    vec![b2.block_hash(), c2.block_hash(), d2.block_hash()]
                );
            }
            other => panic!("expected reorg, got {:?}", other),
        }

        assert_eq!(chain.height(), 3);
        assert_eq!(chain.tip_hash(), d2.block_hash());
        assert!(!chain.contains(&b.block_hash()));
        assert!(!chain.contains(&c.block_hash()));
        assert!(chain.contains(&b2.block_hash()));
        assert_eq!(chain.side_branch_count(), 2);
    }

    #[test]
    fn test_fork_too_deep() {
        let mut chain = HeaderChain::new(NetworkParams::new(Network::Regtest), 2);
        let genesis = chain.tip().header;
        let mut tip = genesis;
        for _ in 0..3 {
            tip = child(&tip, 1);
            chain.try_append_at(tip, NOW).unwrap();
        }

        let fork = child(&genesis, 9);
        assert!(matches!(
            chain.try_append_at(fork, NOW),
            Err(ChainError::ForkTooDeep { fork_height: 0, tip_height: 3, max_depth: 2 })
        ));
    }

    #[test]
    fn test_locator_shape() {
        let mut chain = regtest_chain();
        let mut tip = chain.tip().header;
        for _ in 0..20 {
            tip = child(&tip, 0);
            chain.try_append_at(tip, NOW).unwrap();
        }

        let locator = chain.locator();
        assert_eq!(locator[0], chain.tip_hash());
        assert_eq!(*locator.last().unwrap(), chain.genesis_hash());
        // 20..=11 one by one, then 9, 5 and genesis
        assert_eq!(locator.len(), 13);
        assert_eq!(chain.height_of(&locator[10]), Some(9));
        assert_eq!(chain.height_of(&locator[11]), Some(5));
    }

    #[test]
    fn test_restore_replays_headers() {
        let mut source = regtest_chain();
        let mut tip = source.tip().header;
        for _ in 0..5 {
            tip = child(&tip, 3);
            source.try_append(tip).unwrap();
        }
        let headers: Vec<BlockHeader> = source.active_headers().copied().collect();

        let mut restored = regtest_chain();
        assert_eq!(restored.restore(&headers), 5);
        assert_eq!(restored.tip_hash(), source.tip_hash());
    }
}
