//! Chain synchronization with peers
//!
//! Header-first sync: every ready peer gets a session that walks the
//! header chain forward with `getheaders`, then asks for filtered blocks
//! covering the newly connected headers. Proven matches and matching
//! transactions go out through the `EventBus`.
//!
//! The engine is owned by the node's event loop task, so it needs no lock
//! of its own; the header chain and watch set are shared behind `RwLock`s.

use crate::core::{
    AddressWatchSet, AppendOutcome, BlockHash, BlockHeader, ChainError, HeaderChain,
    MerkleBlock, MerkleProofVerifier, Transaction, Txid,
};
use crate::error::SpvError;
use crate::network::events::{BlockEvent, EventBus, TransactionEvent};
use crate::network::message::{GetHeadersMessage, InvItem, InvType, Message, MAX_HEADERS_RESULTS};
use crate::network::peer::{PeerError, PeerId, PeerInfo};
use crate::network::pool::{NetEvent, PeerCommand, PeerPool};
use crate::storage::{ChainStore, MatchRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, Instant};

/// Default wait for a requested `headers`, `merkleblock` or `tx`
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often outstanding requests are checked
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Blocks below the tip by more than this are no longer tracked for
/// transaction dedup
pub const RETAIN_DEPTH: u32 = 144;

/// Instructions from the node to the event loop
#[derive(Debug)]
pub enum SyncControl {
    Start,
    Shutdown,
}

/// Per-session position in the header chain. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    /// First locator hash of the outstanding `getheaders`
    pub last_requested: Option<BlockHash>,
    /// Last header this peer delivered that we accepted
    pub last_received: Option<BlockHash>,
    pub height: u32,
}

impl SyncCursor {
    pub fn new(height: u32) -> Self {
        Self {
            last_requested: None,
            last_received: None,
            height,
        }
    }

    pub fn requested(&mut self, from: BlockHash) {
        self.last_requested = Some(from);
    }

    /// Record a received header; ignored unless it is higher than before
    pub fn advance(&mut self, hash: BlockHash, height: u32) -> bool {
        if height <= self.height && self.last_received.is_some() {
            return false;
        }
        self.last_received = Some(hash);
        self.height = height;
        true
    }
}

#[derive(Debug)]
struct Session {
    cursor: SyncCursor,
    /// Outstanding `getheaders`, if any
    headers_requested: Option<Instant>,
    blocks_in_flight: HashMap<BlockHash, Instant>,
    txs_in_flight: HashMap<Txid, Instant>,
}

impl Session {
    fn new(height: u32) -> Self {
        Self {
            cursor: SyncCursor::new(height),
            headers_requested: None,
            blocks_in_flight: HashMap::new(),
            txs_in_flight: HashMap::new(),
        }
    }

    fn oldest_request(&self) -> Option<Instant> {
        self.headers_requested
            .into_iter()
            .chain(self.blocks_in_flight.values().copied())
            .chain(self.txs_in_flight.values().copied())
            .min()
    }
}

/// Drives header sync and filtered block download across the pool
pub struct SyncEngine {
    chain: Arc<RwLock<HeaderChain>>,
    watch: Arc<RwLock<AddressWatchSet>>,
    pool: Arc<PeerPool>,
    events: Arc<EventBus>,
    store: Box<dyn ChainStore>,
    request_timeout: Duration,
    syncing: bool,
    /// Peers whose filter is loaded, with or without a session
    ready: HashMap<PeerId, PeerInfo>,
    sessions: HashMap<PeerId, Session>,
    /// Filtered blocks that lost their peer, with the peers that said `notfound`
    pending_blocks: HashMap<BlockHash, HashSet<PeerId>>,
    /// Txids proven by a verified merkle block, with block and height
    confirmed: HashMap<Txid, (BlockHash, u32)>,
    /// (txid, block) pairs already reported, keyed to the height they were
    /// seen at; `None` is the unconfirmed context
    emitted: HashMap<(Txid, Option<BlockHash>), u32>,
}

impl SyncEngine {
    pub fn new(
        chain: Arc<RwLock<HeaderChain>>,
        watch: Arc<RwLock<AddressWatchSet>>,
        pool: Arc<PeerPool>,
        events: Arc<EventBus>,
        store: Box<dyn ChainStore>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            watch,
            pool,
            events,
            store,
            request_timeout,
            syncing: false,
            ready: HashMap::new(),
            sessions: HashMap::new(),
            pending_blocks: HashMap::new(),
            confirmed: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// The session cursor for a peer
    pub fn cursor(&self, id: PeerId) -> Option<SyncCursor> {
        self.sessions.get(&id).map(|s| s.cursor)
    }

    /// Filtered blocks waiting for a peer to take them
    pub fn pending_blocks(&self) -> usize {
        self.pending_blocks.len()
    }

    /// Event loop: runs until shutdown or until every sender is gone
    pub async fn run(
        mut self,
        mut net_events: mpsc::Receiver<NetEvent>,
        mut control: mpsc::Receiver<SyncControl>,
    ) {
        let mut ticker = time::interval(TIMEOUT_CHECK_INTERVAL);

        loop {
            tokio::select! {
                Some(event) = net_events.recv() => {
                    self.handle_event(event).await;
                }
                command = control.recv() => match command {
                    Some(SyncControl::Start) => self.start_sync().await,
                    Some(SyncControl::Shutdown) | None => {
                        log::info!("Sync engine shutting down...");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.check_timeouts().await;
                }
            }
        }
    }

    /// Begin syncing with every ready peer, and with peers as they arrive
    pub async fn start_sync(&mut self) {
        if !self.syncing {
            log::info!("Starting header sync");
        }
        self.syncing = true;

        let waiting: Vec<PeerId> = self
            .ready
            .keys()
            .filter(|id| !self.sessions.contains_key(id))
            .copied()
            .collect();
        for id in waiting {
            self.start_session(id).await;
        }
    }

    pub async fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Ready { id, info } => {
                self.ready.insert(id, info.clone());
                self.events.emit_peer_connected(info).await;
                if self.syncing {
                    self.start_session(id).await;
                }
            }
            NetEvent::FilterReloaded { id } => {
                if self.sessions.contains_key(&id) {
                    self.command(id, PeerCommand::BeginSync).await;
                }
            }
            NetEvent::Message { id, message } => {
                if let Err(e) = self.handle_message(id, message).await {
                    self.on_error(id, e).await;
                }
            }
            NetEvent::Closed { id, addr, error } => {
                self.end_session(id);
                self.ready.remove(&id);
                self.pool.remove(id).await;
                if error.as_ref().map(|e| e.is_misbehavior()).unwrap_or(false) {
                    self.pool.ban(addr).await;
                }
                self.events
                    .emit_peer_disconnected(id, addr, error.map(|e| e.to_string()))
                    .await;
                self.dispatch_pending().await;
            }
        }
    }

    /// Route a message forwarded by a peer's connection task
    pub async fn handle_message(&mut self, id: PeerId, message: Message) -> Result<(), SpvError> {
        match message {
            Message::Headers(headers) => self.handle_headers(id, headers).await,
            Message::MerkleBlock(block) => self.handle_merkle_block(id, block).await,
            Message::Tx(tx) => self.handle_tx(id, tx).await,
            Message::Inv(items) => self.handle_inv(id, items).await,
            Message::NotFound(items) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    for item in &items {
                        if session.blocks_in_flight.remove(&item.hash).is_some() {
                            self.pending_blocks.entry(item.hash).or_default().insert(id);
                        }
                        session.txs_in_flight.remove(&item.hash);
                    }
                }
                log::debug!("Peer {} lacks {} of our requests", id, items.len());
                self.dispatch_pending().await;
                Ok(())
            }
            other => {
                log::debug!("Ignoring {} from peer {}", other.command(), id);
                Ok(())
            }
        }
    }

    async fn start_session(&mut self, id: PeerId) {
        if self.sessions.contains_key(&id) {
            return;
        }
        let height = self.chain.read().await.height();
        self.sessions.insert(id, Session::new(height));
        self.command(id, PeerCommand::BeginSync).await;
        log::info!("Started sync session with peer {} at height {}", id, height);
        self.request_headers(id).await;
        self.dispatch_pending().await;
    }

    /// Drop a peer's session, handing its outstanding filtered blocks back
    fn end_session(&mut self, id: PeerId) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        if !session.blocks_in_flight.is_empty() {
            log::debug!(
                "Requeueing {} filtered blocks from peer {}",
                session.blocks_in_flight.len(),
                id
            );
        }
        for hash in session.blocks_in_flight.into_keys() {
            self.pending_blocks.entry(hash).or_default();
        }
    }

    /// Hand requeued filtered blocks to the least busy peers that have not
    /// refused them
    async fn dispatch_pending(&mut self) {
        if self.pending_blocks.is_empty() || self.sessions.is_empty() {
            return;
        }
        if self.watch.read().await.is_empty() {
            self.pending_blocks.clear();
            return;
        }

        let mut wanted: Vec<(u32, BlockHash)> = {
            let chain = self.chain.read().await;
            self.pending_blocks
                .retain(|hash, _| chain.height_of(hash).is_some());
            self.pending_blocks
                .keys()
                .filter_map(|hash| chain.height_of(hash).map(|height| (height, *hash)))
                .collect()
        };
        wanted.sort();

        let mut assigned: HashMap<PeerId, Vec<(BlockHash, u32)>> = HashMap::new();
        for (height, hash) in wanted {
            let refused = self.pending_blocks.get(&hash);
            let peer = self
                .sessions
                .iter()
                .filter(|(id, _)| !refused.map(|r| r.contains(*id)).unwrap_or(false))
                .min_by_key(|(id, session)| {
                    let queued = assigned.get(*id).map(Vec::len).unwrap_or(0);
                    (session.blocks_in_flight.len() + queued, **id)
                })
                .map(|(id, _)| *id);
            if let Some(peer) = peer {
                assigned.entry(peer).or_default().push((hash, height));
            }
        }

        for (id, blocks) in assigned {
            self.request_filtered_blocks(id, &blocks).await;
        }
    }

    async fn request_headers(&mut self, id: PeerId) {
        let locator = self.chain.read().await.locator();
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.headers_requested = Some(Instant::now());
        if let Some(first) = locator.first() {
            session.cursor.requested(*first);
        }
        self.send(id, Message::GetHeaders(GetHeadersMessage::new(locator)))
            .await;
    }

    async fn handle_headers(
        &mut self,
        id: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Result<(), SpvError> {
        let Some(session) = self.sessions.get_mut(&id) else {
            log::debug!("Ignoring unsolicited headers from peer {}", id);
            return Ok(());
        };
        session.headers_requested = None;

        if headers.is_empty() {
            log::info!(
                "Headers synced with peer {} at height {}",
                id,
                session.cursor.height
            );
            return Ok(());
        }

        let mut connected: Vec<(BlockHash, u32)> = Vec::new();
        let mut disconnected: Vec<BlockHash> = Vec::new();
        let mut failure = None;
        let mut last = None;
        let mut delta = None;

        {
            let mut chain = self.chain.write().await;
            let mut lowest = chain.height();
            for header in &headers {
                match chain.try_append(*header) {
                    Ok(AppendOutcome::Accepted { height }) => {
                        connected.push((header.block_hash(), height));
                    }
                    Ok(AppendOutcome::Reorganized {
                        fork_height,
                        disconnected: dropped,
                        connected: hashes,
                    }) => {
                        lowest = lowest.min(fork_height);
                        connected.retain(|(hash, _)| !dropped.contains(hash));
                        connected.extend(
                            hashes
                                .iter()
                                .enumerate()
                                .map(|(i, hash)| (*hash, fork_height + 1 + i as u32)),
                        );
                        disconnected.extend(dropped);
                    }
                    Ok(AppendOutcome::SideBranch { .. }) | Ok(AppendOutcome::AlreadyKnown) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
                if let Some(entry) = chain.get(&header.block_hash()) {
                    last = Some((entry.hash, entry.height));
                }
            }

            if !connected.is_empty() || !disconnected.is_empty() {
                let tip = chain.height();
                let changed: Vec<BlockHeader> = ((lowest + 1)..=tip)
                    .filter_map(|height| chain.header_at(height).copied())
                    .collect();
                delta = Some((lowest, changed, tip));
                log::info!("Header sync: height {} (peer {})", tip, id);
            }
        }

        for hash in &disconnected {
            self.confirmed.retain(|_, (block, _)| block != hash);
        }
        if let Some((fork_height, changed, tip)) = delta {
            self.persist_headers(fork_height, &changed).await;
            self.prune(tip);
        }

        let full_batch = headers.len() == MAX_HEADERS_RESULTS;
        if let Some(session) = self.sessions.get_mut(&id) {
            if let Some((hash, height)) = last {
                session.cursor.advance(hash, height);
            }
        }

        self.request_filtered_blocks(id, &connected).await;

        if full_batch && failure.is_none() {
            self.request_headers(id).await;
        }

        match failure {
            Some(e) => Err(SpvError::ChainInconsistency(e)),
            None => Ok(()),
        }
    }

    /// Write the headers above `fork_height`. A store that fell out of step
    /// with the chain is rewritten from genesis.
    async fn persist_headers(&mut self, fork_height: u32, headers: &[BlockHeader]) {
        if let Err(e) = self.store.write_headers(fork_height, headers) {
            log::warn!("Rewriting header store after failed write: {}", e);
            let active: Vec<BlockHeader> = self
                .chain
                .read()
                .await
                .active_headers()
                .skip(1)
                .copied()
                .collect();
            if let Err(e) = self.store.write_headers(0, &active) {
                log::error!("Failed to persist headers: {}", e);
            }
        }
    }

    /// Forget dedup state for blocks buried deeper than `RETAIN_DEPTH`
    fn prune(&mut self, tip: u32) {
        let floor = tip.saturating_sub(RETAIN_DEPTH);
        self.confirmed.retain(|_, (_, height)| *height >= floor);
        self.emitted.retain(|_, height| *height >= floor);
    }

    /// Ask for `merkleblock`s covering newly connected headers
    async fn request_filtered_blocks(&mut self, id: PeerId, connected: &[(BlockHash, u32)]) {
        if connected.is_empty() || self.watch.read().await.is_empty() {
            return;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            for (hash, _) in connected {
                self.pending_blocks.entry(*hash).or_default();
            }
            return;
        };

        let now = Instant::now();
        let items: Vec<InvItem> = connected
            .iter()
            .map(|(hash, _)| {
                session.blocks_in_flight.insert(*hash, now);
                self.pending_blocks.remove(hash);
                InvItem::new(InvType::FilteredBlock, *hash)
            })
            .collect();
        log::debug!("Requesting {} filtered blocks from peer {}", items.len(), id);
        self.send(id, Message::GetData(items)).await;
    }

    async fn handle_merkle_block(&mut self, id: PeerId, block: MerkleBlock) -> Result<(), SpvError> {
        let hash = block.block_hash();
        if let Some(session) = self.sessions.get_mut(&id) {
            session.blocks_in_flight.remove(&hash);
        }
        self.pending_blocks.remove(&hash);

        let (header, height) = {
            let chain = self.chain.read().await;
            match chain.height_of(&hash).and_then(|h| chain.header_at(h).map(|hd| (*hd, h))) {
                Some(found) => found,
                None => return Err(ChainError::UnknownBlock(hash).into()),
            }
        };

        let verified = MerkleProofVerifier::verify_block(&header, &block)?;
        for txid in &verified.txids {
            self.confirmed.insert(*txid, (hash, height));
            self.store
                .record_match(MatchRecord::new(*txid, Some(hash), Some(height)))?;
        }
        if !verified.is_empty() {
            log::info!(
                "Block {} at height {} proves {} matching transactions",
                hash,
                height,
                verified.txids.len()
            );
        }

        self.events
            .emit_block(BlockEvent {
                hash,
                height,
                header,
                matched: verified.txids,
                peer: id,
            })
            .await;
        Ok(())
    }

    async fn handle_tx(&mut self, id: PeerId, tx: Transaction) -> Result<(), SpvError> {
        let txid = tx.txid();
        if let Some(session) = self.sessions.get_mut(&id) {
            session.txs_in_flight.remove(&txid);
        }

        let (block_hash, height) = match self.confirmed.get(&txid) {
            Some(&(block, height)) => (Some(block), Some(height)),
            None => {
                let matched = self.watch.write().await.filter()?.matches_transaction(&tx);
                if !matched {
                    log::debug!("Transaction {} from peer {} does not match", txid, id);
                    return Ok(());
                }
                (None, None)
            }
        };

        if self.emitted.contains_key(&(txid, block_hash)) {
            return Ok(());
        }
        let seen_at = match height {
            Some(height) => height,
            None => self.chain.read().await.height(),
        };
        self.emitted.insert((txid, block_hash), seen_at);
        if block_hash.is_none() {
            self.store.record_match(MatchRecord::new(txid, None, None))?;
        }

        log::info!(
            "Matched transaction {} ({})",
            txid,
            match height {
                Some(h) => format!("confirmed at height {}", h),
                None => "unconfirmed".to_string(),
            }
        );
        self.events
            .emit_transaction(TransactionEvent {
                txid,
                tx,
                block_hash,
                height,
                peer: id,
            })
            .await;
        Ok(())
    }

    async fn handle_inv(&mut self, id: PeerId, items: Vec<InvItem>) -> Result<(), SpvError> {
        let mut wanted = Vec::new();
        let mut new_block = false;
        {
            let chain = self.chain.read().await;
            for item in &items {
                match item.inv_type {
                    InvType::Tx | InvType::WitnessTx => {
                        let in_flight = self
                            .sessions
                            .get(&id)
                            .map(|s| s.txs_in_flight.contains_key(&item.hash))
                            .unwrap_or(false);
                        if !in_flight && !self.emitted.contains_key(&(item.hash, None)) {
                            wanted.push(InvItem::new(InvType::Tx, item.hash));
                        }
                    }
                    InvType::Block | InvType::WitnessBlock | InvType::FilteredBlock => {
                        if chain.get(&item.hash).is_none() {
                            new_block = true;
                        }
                    }
                    _ => {}
                }
            }
        }

        if !wanted.is_empty() {
            if let Some(session) = self.sessions.get_mut(&id) {
                let now = Instant::now();
                for item in &wanted {
                    session.txs_in_flight.insert(item.hash, now);
                }
            }
            log::debug!("Requesting {} transactions from peer {}", wanted.len(), id);
            self.send(id, Message::GetData(wanted)).await;
        }

        let idle = self
            .sessions
            .get(&id)
            .map(|s| s.headers_requested.is_none())
            .unwrap_or(false);
        if new_block && idle {
            self.request_headers(id).await;
        }
        Ok(())
    }

    /// Disconnect peers sitting on a request past the timeout
    pub async fn check_timeouts(&mut self) {
        let stalled: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.oldest_request()
                    .map(|at| at.elapsed() > self.request_timeout)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &stalled {
            log::warn!("Peer {} stalled, disconnecting", id);
            self.end_session(*id);
            self.pool.abort(*id).await;
        }
        if !stalled.is_empty() {
            self.dispatch_pending().await;
        }
    }

    async fn on_error(&mut self, id: PeerId, err: SpvError) {
        if err.is_peer_fault() {
            log::warn!("Disconnecting peer {}: {}", id, err);
            if let Some(handle) = self.pool.get(id).await {
                self.pool.ban(handle.addr).await;
            }
            self.end_session(id);
            self.command(id, PeerCommand::Disconnect).await;
            self.dispatch_pending().await;
        } else if let SpvError::ChainInconsistency(e) = &err {
            log::debug!("Discarded data from peer {}: {}", id, e);
        } else {
            log::warn!("Error handling message from peer {}: {}", id, err);
        }
    }

    async fn send(&mut self, id: PeerId, msg: Message) {
        self.command(id, PeerCommand::Send(msg)).await;
    }

    /// Queue a command for a peer's task. Never waits on the peer: a full
    /// queue drops the peer so one slow connection cannot hold the loop.
    async fn command(&mut self, id: PeerId, command: PeerCommand) {
        match self.pool.try_command(id, command).await {
            Ok(()) => {}
            Err(PeerError::Stalled) => {
                log::warn!("Peer {} is not keeping up, dropping it", id);
                self.end_session(id);
                self.ready.remove(&id);
                self.pool.abort(id).await;
            }
            Err(e) => log::debug!("Peer {} is gone: {}", id, e),
        }
    }
}
