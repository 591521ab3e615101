//! Peer pool
//!
//! Single owner of the peer table. Connection tasks hold the `Peer` state
//! machines; the pool keeps a `PeerHandle` per connection for sending
//! commands and reading the latest `PeerInfo`, and enforces connection
//! limits, reconnect backoff and session bans.

use crate::core::BloomFilter;
use crate::network::message::Message;
use crate::network::peer::{PeerError, PeerId, PeerInfo, PeerState};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::Instant;

/// Default outbound connection limit
pub const MAX_OUTBOUND: usize = 8;

/// Default inbound connection limit
pub const MAX_INBOUND: usize = 16;

/// Default wait before reconnecting to an address that dropped
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Commands a connection task may have queued before it counts as stalled
pub const COMMAND_QUEUE_SIZE: usize = 100;

/// Instructions from the node to a connection task
#[derive(Debug, Clone)]
pub enum PeerCommand {
    Send(Message),
    /// Move the peer into its sync session
    BeginSync,
    Disconnect,
}

/// Notifications from connection tasks to the event loop
#[derive(Debug)]
pub enum NetEvent {
    /// Handshake done and filter loaded
    Ready { id: PeerId, info: PeerInfo },
    /// A message the sync engine should see
    Message { id: PeerId, message: Message },
    /// A fresh filter was sent; the session must be re-entered
    FilterReloaded { id: PeerId },
    /// The connection is gone
    Closed {
        id: PeerId,
        addr: SocketAddr,
        error: Option<PeerError>,
    },
}

/// Connection limits and retry policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub reconnect_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_outbound: MAX_OUTBOUND,
            max_inbound: MAX_INBOUND,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

/// Handle for talking to a peer's connection task
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub outbound: bool,
    tx: mpsc::Sender<PeerCommand>,
    info: watch::Receiver<PeerInfo>,
    close: Arc<Notify>,
}

impl PeerHandle {
    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.command(PeerCommand::Send(msg)).await
    }

    pub async fn command(&self, command: PeerCommand) -> Result<(), PeerError> {
        self.tx.send(command).await.map_err(|_| PeerError::Disconnected)
    }

    /// Queue a command without waiting. A full queue means the task is
    /// stuck writing to a peer that stopped reading.
    pub fn try_command(&self, command: PeerCommand) -> Result<(), PeerError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => PeerError::Stalled,
            TrySendError::Closed(_) => PeerError::Disconnected,
        })
    }

    /// Tear the connection down even if its task is blocked on a write
    pub fn abort(&self) {
        self.close.notify_one();
    }

    /// Latest snapshot published by the connection task
    pub fn info(&self) -> PeerInfo {
        self.info.borrow().clone()
    }
}

fn close(handle: &PeerHandle) {
    match handle.try_command(PeerCommand::Disconnect) {
        Err(PeerError::Stalled) => handle.abort(),
        // A task that already exited has nothing left to close
        Ok(()) | Err(_) => {}
    }
}

/// The connection task's end of a registered peer
#[derive(Debug)]
pub struct PeerLink {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub outbound: bool,
    pub commands: mpsc::Receiver<PeerCommand>,
    pub filter: watch::Receiver<BloomFilter>,
    pub info: watch::Sender<PeerInfo>,
    /// Signalled by `PeerHandle::abort`
    pub close: Arc<Notify>,
}

/// Manages all peer connections
pub struct PeerPool {
    config: PoolConfig,
    handles: RwLock<HashMap<PeerId, PeerHandle>>,
    /// When each address last disconnected
    recent: RwLock<HashMap<SocketAddr, Instant>>,
    /// Misbehaving addresses, never retried this session
    banned: RwLock<HashSet<SocketAddr>>,
    filter: watch::Sender<BloomFilter>,
    next_id: AtomicU64,
}

impl PeerPool {
    pub fn new(config: PoolConfig, filter: BloomFilter) -> Self {
        let (filter, _) = watch::channel(filter);
        Self {
            config,
            handles: RwLock::new(HashMap::new()),
            recent: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashSet::new()),
            filter,
            next_id: AtomicU64::new(1),
        }
    }

    /// Admit a new connection, returning the task's end of it.
    ///
    /// Outbound attempts to an address already in the pool fail with
    /// `AlreadyConnected`, so repeated connects are harmless.
    pub async fn register(&self, addr: SocketAddr, outbound: bool) -> Result<PeerLink, PeerError> {
        if self.banned.read().await.contains(&addr) {
            return Err(PeerError::Banned(addr));
        }

        let mut handles = self.handles.write().await;
        if handles.values().any(|h| h.addr == addr) {
            return Err(PeerError::AlreadyConnected(addr));
        }

        let (count, limit) = if outbound {
            (
                handles.values().filter(|h| h.outbound).count(),
                self.config.max_outbound,
            )
        } else {
            (
                handles.values().filter(|h| !h.outbound).count(),
                self.config.max_inbound,
            )
        };
        if count >= limit {
            return Err(PeerError::MaxPeersReached);
        }

        if outbound {
            if let Some(left) = self.recent.read().await.get(&addr) {
                if left.elapsed() < self.config.reconnect_backoff {
                    return Err(PeerError::Backoff(addr));
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let (info_tx, info_rx) = watch::channel(PeerInfo {
            id,
            addr,
            outbound,
            state: PeerState::Connecting,
            version: 0,
            services: Default::default(),
            user_agent: String::new(),
            start_height: 0,
            connected_at: now,
            last_seen: now,
        });
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let close = Arc::new(Notify::new());

        handles.insert(
            id,
            PeerHandle {
                id,
                addr,
                outbound,
                tx,
                info: info_rx,
                close: close.clone(),
            },
        );
        log::info!("Added peer {} ({}, outbound: {})", id, addr, outbound);

        Ok(PeerLink {
            id,
            addr,
            outbound,
            commands: rx,
            filter: self.filter.subscribe(),
            info: info_tx,
            close,
        })
    }

    /// Drop a peer from the table and start its reconnect backoff
    pub async fn remove(&self, id: PeerId) -> Option<PeerHandle> {
        let handle = self.handles.write().await.remove(&id)?;
        let mut recent = self.recent.write().await;
        recent.retain(|_, left| left.elapsed() < self.config.reconnect_backoff);
        recent.insert(handle.addr, Instant::now());
        drop(recent);
        log::info!("Removed peer {} ({})", id, handle.addr);
        Some(handle)
    }

    /// Ban an address for the rest of the session
    pub async fn ban(&self, addr: SocketAddr) {
        if self.banned.write().await.insert(addr) {
            log::warn!("Banned peer {} for this session", addr);
        }
    }

    pub async fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned.read().await.contains(addr)
    }

    pub async fn get(&self, id: PeerId) -> Option<PeerHandle> {
        self.handles.read().await.get(&id).cloned()
    }

    /// Send a message to a specific peer
    pub async fn send_to(&self, id: PeerId, msg: Message) -> Result<(), PeerError> {
        self.command(id, PeerCommand::Send(msg)).await
    }

    pub async fn command(&self, id: PeerId, command: PeerCommand) -> Result<(), PeerError> {
        let handle = self.get(id).await.ok_or(PeerError::Disconnected)?;
        handle.command(command).await
    }

    /// Queue a command for a peer without waiting on its task
    pub async fn try_command(&self, id: PeerId, command: PeerCommand) -> Result<(), PeerError> {
        let handle = self.get(id).await.ok_or(PeerError::Disconnected)?;
        handle.try_command(command)
    }

    /// Tear a connection down without going through its command queue
    pub async fn abort(&self, id: PeerId) {
        if let Some(handle) = self.get(id).await {
            log::debug!("Aborting connection to peer {} ({})", id, handle.addr);
            handle.abort();
        }
    }

    /// Ask a peer's task to close the connection, aborting it if its queue
    /// is full
    pub async fn disconnect(&self, id: PeerId) -> Result<(), PeerError> {
        let handle = self.get(id).await.ok_or(PeerError::Disconnected)?;
        close(&handle);
        Ok(())
    }

    /// Ask every connection to close
    pub async fn disconnect_all(&self) {
        let handles: Vec<PeerHandle> = self.handles.read().await.values().cloned().collect();
        for handle in &handles {
            close(handle);
        }
    }

    /// Publish a new filter; every filtered peer reloads it
    pub fn broadcast_filter(&self, filter: BloomFilter) {
        self.filter.send_replace(filter);
    }

    /// The filter new peers will load
    pub fn current_filter(&self) -> BloomFilter {
        self.filter.borrow().clone()
    }

    /// Snapshot of every peer, ordered by id
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .handles
            .read()
            .await
            .values()
            .map(PeerHandle::info)
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub async fn peer_count(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Peers whose filter is loaded
    pub async fn ready_count(&self) -> usize {
        self.handles
            .read()
            .await
            .values()
            .filter(|h| matches!(h.info().state, PeerState::FilterLoaded | PeerState::Synced))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BloomFlags;

    fn filter(item: &[u8]) -> BloomFilter {
        BloomFilter::build([item], 0.001, 7, BloomFlags::None).unwrap()
    }

    fn pool(config: PoolConfig) -> PeerPool {
        PeerPool::new(config, filter(b"initial"))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_duplicate_address_rejected() {
        let pool = pool(PoolConfig::default());
        let link = pool.register(addr(1), true).await.unwrap();
        assert!(matches!(
            pool.register(addr(1), true).await,
            Err(PeerError::AlreadyConnected(_))
        ));
        assert_eq!(pool.peer_count().await, 1);
        assert_eq!(pool.peers().await[0].id, link.id);
    }

    #[tokio::test]
    async fn test_limits_per_direction() {
        let pool = pool(PoolConfig {
            max_outbound: 1,
            max_inbound: 1,
            ..PoolConfig::default()
        });
        let _out = pool.register(addr(1), true).await.unwrap();
        assert!(matches!(
            pool.register(addr(2), true).await,
            Err(PeerError::MaxPeersReached)
        ));

        let _inb = pool.register(addr(3), false).await.unwrap();
        assert!(matches!(
            pool.register(addr(4), false).await,
            Err(PeerError::MaxPeersReached)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_backoff() {
        let pool = pool(PoolConfig::default());
        let link = pool.register(addr(1), true).await.unwrap();
        pool.remove(link.id).await.unwrap();
        assert!(matches!(
            pool.register(addr(1), true).await,
            Err(PeerError::Backoff(_))
        ));

        let eager = self::pool(PoolConfig {
            reconnect_backoff: Duration::ZERO,
            ..PoolConfig::default()
        });
        let link = eager.register(addr(1), true).await.unwrap();
        eager.remove(link.id).await.unwrap();
        assert!(eager.register(addr(1), true).await.is_ok());
    }

    #[tokio::test]
    async fn test_banned_never_retried() {
        let pool = pool(PoolConfig {
            reconnect_backoff: Duration::ZERO,
            ..PoolConfig::default()
        });
        let link = pool.register(addr(1), true).await.unwrap();
        pool.ban(addr(1)).await;
        pool.remove(link.id).await;
        assert!(matches!(
            pool.register(addr(1), true).await,
            Err(PeerError::Banned(_))
        ));
        assert!(matches!(
            pool.register(addr(1), false).await,
            Err(PeerError::Banned(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_reach_link() {
        let pool = pool(PoolConfig::default());
        let mut link = pool.register(addr(1), true).await.unwrap();
        pool.send_to(link.id, Message::Ping(3)).await.unwrap();
        assert!(matches!(
            link.commands.recv().await,
            Some(PeerCommand::Send(Message::Ping(3)))
        ));

        pool.remove(link.id).await;
        assert!(matches!(
            pool.send_to(link.id, Message::Ping(4)).await,
            Err(PeerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_reports_stalled() {
        let pool = pool(PoolConfig::default());
        let link = pool.register(addr(1), true).await.unwrap();
        for _ in 0..COMMAND_QUEUE_SIZE {
            pool.try_command(link.id, PeerCommand::BeginSync).await.unwrap();
        }
        assert!(matches!(
            pool.try_command(link.id, PeerCommand::BeginSync).await,
            Err(PeerError::Stalled)
        ));

        drop(link);
        let link = pool.register(addr(2), true).await.unwrap();
        let id = link.id;
        drop(link);
        assert!(matches!(
            pool.try_command(id, PeerCommand::BeginSync).await,
            Err(PeerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_abort_signals_link() {
        let pool = pool(PoolConfig::default());
        let link = pool.register(addr(1), true).await.unwrap();
        pool.abort(link.id).await;
        tokio::time::timeout(Duration::from_secs(1), link.close.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_backoff_entries_dropped() {
        let pool = pool(PoolConfig {
            reconnect_backoff: Duration::from_millis(20),
            ..PoolConfig::default()
        });
        let first = pool.register(addr(1), true).await.unwrap();
        pool.remove(first.id).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = pool.register(addr(2), true).await.unwrap();
        pool.remove(second.id).await;
        let recent = pool.recent.read().await;
        assert_eq!(recent.len(), 1);
        assert!(recent.contains_key(&addr(2)));
    }

    #[tokio::test]
    async fn test_filter_broadcast() {
        let pool = pool(PoolConfig::default());
        let mut link = pool.register(addr(1), true).await.unwrap();
        assert!(link.filter.borrow_and_update().contains(b"initial"));

        pool.broadcast_filter(filter(b"updated"));
        link.filter.changed().await.unwrap();
        assert!(link.filter.borrow().contains(b"updated"));
    }

    #[tokio::test]
    async fn test_info_published_by_task() {
        let pool = pool(PoolConfig::default());
        let link = pool.register(addr(1), true).await.unwrap();
        assert_eq!(pool.ready_count().await, 0);

        link.info.send_modify(|info| info.state = PeerState::Synced);
        assert_eq!(pool.ready_count().await, 1);
        assert_eq!(pool.peers().await[0].state, PeerState::Synced);
    }
}
