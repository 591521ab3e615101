//! SPV node
//!
//! Ties the pieces together: header chain, watch set, peer pool, sync
//! engine and event bus. This is the consumer-facing API.

use crate::core::{
    AddressWatchSet, BlockHash, BloomFlags, HeaderChain, Network, NetworkParams, WatchedItem,
    DEFAULT_FALSE_POSITIVE_RATE, DEFAULT_MAX_REORG_DEPTH,
};
use crate::error::SpvError;
use crate::network::events::{BlockEvent, EventBus, SpvEvent, TransactionEvent};
use crate::network::peer::{PeerError, PeerId, PeerInfo};
use crate::network::pool::{
    NetEvent, PeerPool, PoolConfig, DEFAULT_RECONNECT_BACKOFF, MAX_INBOUND, MAX_OUTBOUND,
};
use crate::network::server::{
    connect_to_peer, handle_connection, Server, SessionConfig, DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::network::sync::{SyncControl, SyncEngine, DEFAULT_REQUEST_TIMEOUT};
use crate::storage::{ChainStore, FileStore, MemoryStore};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    /// Data directory; each network gets its own subdirectory
    pub data_dir: PathBuf,
    /// Keep headers and matches in memory only
    pub memory: bool,
    /// Accept inbound peers on this port
    pub listen_port: Option<u16>,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub false_positive_rate: f64,
    pub bloom_flags: BloomFlags,
    pub max_reorg_depth: u32,
    pub user_agent: String,
    /// Peers to connect to on open
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            data_dir: PathBuf::from(".spv_data"),
            memory: false,
            listen_port: None,
            max_outbound: MAX_OUTBOUND,
            max_inbound: MAX_INBOUND,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            bloom_flags: BloomFlags::None,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            user_agent: format!("/spv-node:{}/", env!("CARGO_PKG_VERSION")),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Overall condition of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    Stopped,
    /// Running, waiting for peers or for `start_sync`
    Idle,
    /// At least one peer has our filter
    Active,
    /// Sync was requested but no peer is connected or connecting
    NoReachablePeers,
}

/// Node status information
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub network: Network,
    pub running: bool,
    pub syncing: bool,
    pub height: u32,
    pub tip: BlockHash,
    pub side_branches: usize,
    pub peers: usize,
    pub ready_peers: usize,
    pub watched: usize,
    pub health: Health,
}

/// Resolves once a `connect_peer` attempt is ready or has failed
pub struct ConnectHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    ready: oneshot::Receiver<Result<PeerInfo, PeerError>>,
    timeout: Duration,
    pool: Arc<PeerPool>,
}

impl ConnectHandle {
    /// Wait for the handshake, bounded by the handshake timeout
    pub async fn wait(self) -> Result<PeerInfo, PeerError> {
        let timeout = self.timeout;
        self.wait_for(timeout).await
    }

    /// Wait at most `timeout`. On expiry the connection is aborted and the
    /// peer leaves the pool.
    pub async fn wait_for(self, timeout: Duration) -> Result<PeerInfo, PeerError> {
        match tokio::time::timeout(timeout, self.ready).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::Disconnected),
            Err(_) => {
                log::info!("Peer {} ({}) not ready in time, aborting", self.id, self.addr);
                self.pool.abort(self.id).await;
                self.pool.remove(self.id).await;
                Err(PeerError::Timeout("handshake"))
            }
        }
    }
}

impl std::fmt::Debug for ConnectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

struct Running {
    net_tx: mpsc::Sender<NetEvent>,
    control: mpsc::Sender<SyncControl>,
    engine: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

/// Lightweight SPV node
pub struct SpvNode {
    config: NodeConfig,
    params: NetworkParams,
    chain: Arc<RwLock<HeaderChain>>,
    watch: Arc<RwLock<AddressWatchSet>>,
    pool: Arc<PeerPool>,
    events: Arc<EventBus>,
    session: SessionConfig,
    sync_requested: AtomicBool,
    running: Option<Running>,
}

impl SpvNode {
    /// Create a stopped node
    pub fn new(config: NodeConfig) -> Result<Self, SpvError> {
        let params = NetworkParams::new(config.network);
        let chain = HeaderChain::new(params.clone(), config.max_reorg_depth);

        let mut watch = AddressWatchSet::new(config.false_positive_rate, config.bloom_flags);
        let filter = watch.filter()?;

        let pool = PeerPool::new(
            PoolConfig {
                max_outbound: config.max_outbound,
                max_inbound: config.max_inbound,
                reconnect_backoff: config.reconnect_backoff,
            },
            filter,
        );

        let session = SessionConfig {
            params: params.clone(),
            user_agent: config.user_agent.clone(),
            start_height: 0,
            local_nonce: rand::random(),
            handshake_timeout: config.handshake_timeout,
        };

        Ok(Self {
            config,
            params,
            chain: Arc::new(RwLock::new(chain)),
            watch: Arc::new(RwLock::new(watch)),
            pool: Arc::new(pool),
            events: Arc::new(EventBus::new()),
            session,
            sync_requested: AtomicBool::new(false),
            running: None,
        })
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Load stored headers, start the event loop and the optional listener,
    /// then dial the bootstrap peers
    pub async fn open(&mut self) -> Result<(), SpvError> {
        if self.running.is_some() {
            return Err(SpvError::AlreadyRunning);
        }

        let store: Box<dyn ChainStore> = if self.config.memory {
            Box::new(MemoryStore::new())
        } else {
            let dir = self.config.data_dir.join(self.params.network.to_string());
            Box::new(FileStore::open(dir, self.params.network)?)
        };

        let stored = store.load_headers()?;
        {
            let mut chain = self.chain.write().await;
            let applied = chain.restore(&stored);
            if applied < stored.len() {
                log::warn!(
                    "Only {} of {} stored headers still validate",
                    applied,
                    stored.len()
                );
            }
            log::info!(
                "Opened {} node at height {} (tip {})",
                self.params.network,
                chain.height(),
                chain.tip_hash()
            );
        }

        let (net_tx, net_rx) = mpsc::channel(1000);
        let (control_tx, control_rx) = mpsc::channel(16);

        let engine = SyncEngine::new(
            self.chain.clone(),
            self.watch.clone(),
            self.pool.clone(),
            self.events.clone(),
            store,
            self.config.request_timeout,
        );
        let engine = tokio::spawn(engine.run(net_rx, control_rx));

        let listener = match self.config.listen_port {
            Some(port) => {
                let server = Server::bind(port).await.map_err(PeerError::from)?;
                Some(tokio::spawn(accept_loop(
                    server,
                    self.pool.clone(),
                    self.chain.clone(),
                    self.session.clone(),
                    net_tx.clone(),
                )))
            }
            None => None,
        };

        self.running = Some(Running {
            net_tx,
            control: control_tx,
            engine,
            listener,
        });

        for peer in self.config.bootstrap_peers.clone() {
            if let Err(e) = self.connect_peer(&peer).await {
                log::warn!("Failed to connect to bootstrap peer {}: {}", peer, e);
            }
        }

        Ok(())
    }

    /// Disconnect every peer and stop the event loop
    pub async fn close(&mut self) -> Result<(), SpvError> {
        let running = self.running.take().ok_or(SpvError::NotRunning)?;

        if let Some(listener) = running.listener {
            listener.abort();
        }
        self.pool.disconnect_all().await;

        // A dead loop has nothing left to stop
        let _ = running.control.send(SyncControl::Shutdown).await;
        let _ = running.engine.await;

        for peer in self.pool.peers().await {
            self.pool.remove(peer.id).await;
        }
        self.sync_requested.store(false, Ordering::Relaxed);
        log::info!("Node closed");
        Ok(())
    }

    /// Begin header sync with every ready peer
    pub async fn start_sync(&self) -> Result<(), SpvError> {
        let running = self.running.as_ref().ok_or(SpvError::NotRunning)?;
        self.sync_requested.store(true, Ordering::Relaxed);
        running
            .control
            .send(SyncControl::Start)
            .await
            .map_err(|_| SpvError::NotRunning)
    }

    /// Dial a peer. `addr` is `host:port`, or a bare host on the network's
    /// default port.
    pub async fn connect_peer(&self, addr: &str) -> Result<ConnectHandle, SpvError> {
        let running = self.running.as_ref().ok_or(SpvError::NotRunning)?;
        let addr = resolve_peer(addr, self.params.default_port).await?;

        let link = self.pool.register(addr, true).await?;
        let id = link.id;
        log::info!("Connecting to peer {} ({})", id, addr);

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut session = self.session.clone();
        session.start_height = self.chain.read().await.height();
        let timeout = session.handshake_timeout;
        let pool = self.pool.clone();
        let net_tx = running.net_tx.clone();

        tokio::spawn(async move {
            match connect_to_peer(addr, timeout).await {
                Ok(stream) => handle_connection(stream, link, session, net_tx, Some(ready_tx)).await,
                Err(e) => {
                    log::warn!("Connection to {} failed: {}", addr, e);
                    pool.remove(id).await;
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        Ok(ConnectHandle {
            id,
            addr,
            ready: ready_rx,
            // Connect and handshake are bounded separately
            timeout: timeout * 2,
            pool: self.pool.clone(),
        })
    }

    pub async fn disconnect_peer(&self, id: PeerId) -> Result<(), SpvError> {
        if self.pool.get(id).await.is_none() {
            return Err(SpvError::UnknownPeer(id));
        }
        self.pool.disconnect(id).await?;
        Ok(())
    }

    /// Start watching an address, outpoint or hex script fragment
    pub async fn watch_address(&self, item: &str) -> Result<WatchedItem, SpvError> {
        let item = WatchedItem::parse(item, &self.params)?;
        self.watch(item.clone()).await?;
        Ok(item)
    }

    pub async fn unwatch_address(&self, item: &str) -> Result<bool, SpvError> {
        let item = WatchedItem::parse(item, &self.params)?;
        self.unwatch(&item).await
    }

    /// Add an item; returns false if it was already watched
    pub async fn watch(&self, item: WatchedItem) -> Result<bool, SpvError> {
        let mut watch = self.watch.write().await;
        log::info!("Watching {}", item);
        if !watch.add(item) {
            return Ok(false);
        }
        self.pool.broadcast_filter(watch.filter()?);
        Ok(true)
    }

    /// Remove an item; returns false if it was not watched
    pub async fn unwatch(&self, item: &WatchedItem) -> Result<bool, SpvError> {
        let mut watch = self.watch.write().await;
        if !watch.remove(item) {
            return Ok(false);
        }
        log::info!("Stopped watching {}", item);
        self.pool.broadcast_filter(watch.filter()?);
        Ok(true)
    }

    pub async fn watched(&self) -> Vec<WatchedItem> {
        self.watch.read().await.snapshot()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.pool.peers().await
    }

    pub async fn status(&self) -> NodeStatus {
        let (height, tip, side_branches) = {
            let chain = self.chain.read().await;
            (chain.height(), chain.tip_hash(), chain.side_branch_count())
        };
        let peers = self.pool.peer_count().await;
        let ready_peers = self.pool.ready_count().await;
        let running = self.running.is_some();
        let syncing = self.sync_requested.load(Ordering::Relaxed);

        let health = if !running {
            Health::Stopped
        } else if ready_peers > 0 {
            Health::Active
        } else if syncing && peers == 0 {
            Health::NoReachablePeers
        } else {
            Health::Idle
        };

        NodeStatus {
            network: self.params.network,
            running,
            syncing,
            height,
            tip,
            side_branches,
            peers,
            ready_peers,
            watched: self.watch.read().await.len(),
            health,
        }
    }

    /// Shared header chain
    pub fn chain(&self) -> Arc<RwLock<HeaderChain>> {
        self.chain.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpvEvent> {
        self.events.subscribe()
    }

    pub async fn on_transaction<F>(&self, handler: F)
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        self.events.on_transaction(handler).await
    }

    pub async fn on_block<F>(&self, handler: F)
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.events.on_block(handler).await
    }

    pub async fn on_peer_connected<F>(&self, handler: F)
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.events.on_peer_connected(handler).await
    }

    pub async fn on_peer_disconnected<F>(&self, handler: F)
    where
        F: Fn(&(PeerId, SocketAddr)) + Send + Sync + 'static,
    {
        self.events.on_peer_disconnected(handler).await
    }
}

/// Parse `host:port`, falling back to DNS and the default port
async fn resolve_peer(addr: &str, default_port: u16) -> Result<SocketAddr, SpvError> {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let target = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, default_port)
    };
    let resolved = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|e| SpvError::Resolve(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| SpvError::Resolve(addr.to_string()));
    resolved
}

async fn accept_loop(
    server: Server,
    pool: Arc<PeerPool>,
    chain: Arc<RwLock<HeaderChain>>,
    base: SessionConfig,
    net_tx: mpsc::Sender<NetEvent>,
) {
    loop {
        let (stream, addr) = match server.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Accept error: {}", e);
                continue;
            }
        };

        let link = match pool.register(addr, false).await {
            Ok(link) => link,
            Err(e) => {
                log::info!("Refused inbound peer {}: {}", addr, e);
                continue;
            }
        };
        log::info!("Inbound connection from {}", addr);

        let mut session = base.clone();
        session.start_height = chain.read().await.height();
        tokio::spawn(handle_connection(stream, link, session, net_tx.clone(), None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::testing::child_with_root;
    use crate::core::{MerkleBlock, OutPoint, Transaction, TxIn, TxOut};
    use crate::crypto::calculate_merkle_root;
    use crate::network::message::{
        InvType, Message, ServiceFlags, VersionMessage, PROTOCOL_VERSION,
    };
    use crate::network::server::MessageCodec;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    /// Forty '1's: not a valid address, so it is taken as a hex push
    const WATCHED_HEX: &str = "1111111111111111111111111111111111111111";

    fn regtest_config() -> NodeConfig {
        NodeConfig {
            network: Network::Regtest,
            memory: true,
            handshake_timeout: Duration::from_secs(5),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_watch_updates_filter() {
        let node = SpvNode::new(regtest_config()).unwrap();
        let item = node.watch_address(WATCHED_HEX).await.unwrap();
        assert_eq!(item, WatchedItem::Script(vec![0x11; 20]));
        assert!(node.pool.current_filter().contains(&[0x11; 20]));
        assert!(!node.watch(item.clone()).await.unwrap());

        assert!(node.unwatch_address(WATCHED_HEX).await.unwrap());
        assert!(!node.unwatch(&item).await.unwrap());
        assert!(node.watched().await.is_empty());
        assert!(node.watch_address("not an address").await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_and_status() {
        let mut node = SpvNode::new(regtest_config()).unwrap();
        assert_eq!(node.status().await.health, Health::Stopped);
        assert!(matches!(node.start_sync().await, Err(SpvError::NotRunning)));

        node.open().await.unwrap();
        assert!(matches!(node.open().await, Err(SpvError::AlreadyRunning)));
        assert_eq!(node.status().await.health, Health::Idle);

        node.start_sync().await.unwrap();
        let status = node.status().await;
        assert_eq!(status.health, Health::NoReachablePeers);
        assert_eq!(status.height, 0);

        node.close().await.unwrap();
        assert_eq!(node.status().await.health, Health::Stopped);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut node = SpvNode::new(regtest_config()).unwrap();
        node.open().await.unwrap();

        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let handle = node
            .connect_peer(&format!("127.0.0.1:{}", port))
            .await
            .unwrap();
        assert!(handle.wait().await.is_err());

        // Inside the reconnect backoff window
        assert!(matches!(
            node.connect_peer(&format!("127.0.0.1:{}", port)).await,
            Err(SpvError::TransportError(PeerError::Backoff(_)))
        ));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout_aborts_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();
        // Accept, then never answer the version
        let silent = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut node = SpvNode::new(regtest_config()).unwrap();
        node.open().await.unwrap();
        let handle = node.connect_peer(&remote.to_string()).await.unwrap();
        assert!(matches!(
            handle.wait_for(Duration::from_millis(200)).await,
            Err(PeerError::Timeout("handshake"))
        ));
        assert!(node.peers().await.is_empty());

        // The connection task closes its socket instead of finishing the handshake
        let stream = silent.await.unwrap();
        let mut framed = Framed::new(stream, MessageCodec::new(node.params().magic));
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(_)) = framed.next().await {}
        })
        .await;
        assert!(closed.is_ok());
        assert!(node.peers().await.is_empty());
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_peer() {
        let addr = resolve_peer("127.0.0.1:18444", 1).await.unwrap();
        assert_eq!(addr.port(), 18444);
        let addr = resolve_peer("localhost", 18444).await.unwrap();
        assert_eq!(addr.port(), 18444);
        assert!(addr.ip().is_loopback());
    }

    /// A regtest full node that serves one header, its filtered block and
    /// the matching transaction
    async fn serve_one_block(listener: TcpListener, tx: Transaction) {
        let (stream, addr) = listener.accept().await.unwrap();
        let params = NetworkParams::new(Network::Regtest);
        let mut framed = Framed::new(stream, MessageCodec::new(params.magic));

        let genesis = params.genesis_header();
        let txids = vec![tx.txid(), crate::crypto::Hash256::hash(b"other")];
        let header = child_with_root(&genesis, calculate_merkle_root(&txids));

        while let Some(Ok(msg)) = framed.next().await {
            match msg {
                Message::Version(_) => {
                    let mut version = VersionMessage::new(addr, 1, 7, "/full-node/");
                    version.version = PROTOCOL_VERSION;
                    version.services = ServiceFlags::NETWORK | ServiceFlags::BLOOM;
                    framed.send(Message::Version(version)).await.unwrap();
                    framed.send(Message::Verack).await.unwrap();
                }
                Message::GetHeaders(_) => {
                    framed.send(Message::Headers(vec![header])).await.unwrap();
                }
                Message::GetData(items) => {
                    assert_eq!(items[0].inv_type, InvType::FilteredBlock);
                    let block = MerkleBlock::from_txids(header, &txids, &[true, false]);
                    framed.send(Message::MerkleBlock(block)).await.unwrap();
                    framed.send(Message::Tx(tx.clone())).await.unwrap();
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_sync_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0x11; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        let tx = Transaction {
            version: 2,
            inputs: vec![TxIn {
                previous_output: OutPoint::new(crate::crypto::Hash256::hash(b"funding"), 1),
                script_sig: vec![0x51],
                sequence: 0xffff_ffff,
                witness: vec![],
            }],
            outputs: vec![TxOut {
                value: 1_000,
                script_pubkey: script,
            }],
            lock_time: 0,
        };
        tokio::spawn(serve_one_block(listener, tx.clone()));

        let mut node = SpvNode::new(regtest_config()).unwrap();
        let mut events = node.subscribe();
        node.watch_address(WATCHED_HEX).await.unwrap();
        node.open().await.unwrap();
        node.start_sync().await.unwrap();

        let info = node
            .connect_peer(&remote.to_string())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(info.user_agent, "/full-node/");
        assert_eq!(node.peers().await.len(), 1);

        let event = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(SpvEvent::Transaction(event)) = events.recv().await {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.txid, tx.txid());
        assert_eq!(event.height, Some(1));

        let status = node.status().await;
        assert_eq!(status.height, 1);
        assert_eq!(status.health, Health::Active);
        node.close().await.unwrap();
    }
}
