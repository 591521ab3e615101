//! Event delivery to the consumer
//!
//! Handlers are registered explicitly per event kind. Every event is also
//! published on a broadcast channel for consumers that prefer a stream.

use crate::core::{BlockHash, BlockHeader, Transaction, Txid};
use crate::network::peer::{PeerId, PeerInfo};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Capacity of the broadcast stream; slow subscribers lose the oldest events
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A transaction that matched the watch set
#[derive(Debug, Clone, Serialize)]
pub struct TransactionEvent {
    pub txid: Txid,
    pub tx: Transaction,
    /// Block that proved inclusion, `None` for an unconfirmed match
    pub block_hash: Option<BlockHash>,
    pub height: Option<u32>,
    pub peer: PeerId,
}

impl TransactionEvent {
    pub fn is_confirmed(&self) -> bool {
        self.block_hash.is_some()
    }
}

/// A filtered block whose proof checked out against the header chain
#[derive(Debug, Clone, Serialize)]
pub struct BlockEvent {
    pub hash: BlockHash,
    pub height: u32,
    pub header: BlockHeader,
    /// Matched txids in block order
    pub matched: Vec<Txid>,
    pub peer: PeerId,
}

/// Everything the node reports
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpvEvent {
    Transaction(TransactionEvent),
    Block(BlockEvent),
    PeerConnected(PeerInfo),
    PeerDisconnected {
        id: PeerId,
        addr: SocketAddr,
        reason: Option<String>,
    },
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registry of consumer callbacks
pub struct EventBus {
    transaction: RwLock<Vec<Handler<TransactionEvent>>>,
    block: RwLock<Vec<Handler<BlockEvent>>>,
    connected: RwLock<Vec<Handler<PeerInfo>>>,
    disconnected: RwLock<Vec<Handler<(PeerId, SocketAddr)>>>,
    stream: broadcast::Sender<SpvEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transaction: RwLock::new(Vec::new()),
            block: RwLock::new(Vec::new()),
            connected: RwLock::new(Vec::new()),
            disconnected: RwLock::new(Vec::new()),
            stream,
        }
    }

    pub async fn on_transaction<F>(&self, handler: F)
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        self.transaction.write().await.push(Arc::new(handler));
    }

    pub async fn on_block<F>(&self, handler: F)
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.block.write().await.push(Arc::new(handler));
    }

    pub async fn on_peer_connected<F>(&self, handler: F)
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.connected.write().await.push(Arc::new(handler));
    }

    pub async fn on_peer_disconnected<F>(&self, handler: F)
    where
        F: Fn(&(PeerId, SocketAddr)) + Send + Sync + 'static,
    {
        self.disconnected.write().await.push(Arc::new(handler));
    }

    /// Stream of every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SpvEvent> {
        self.stream.subscribe()
    }

    pub async fn emit_transaction(&self, event: TransactionEvent) {
        for handler in self.transaction.read().await.iter() {
            handler(&event);
        }
        self.publish(SpvEvent::Transaction(event));
    }

    pub async fn emit_block(&self, event: BlockEvent) {
        for handler in self.block.read().await.iter() {
            handler(&event);
        }
        self.publish(SpvEvent::Block(event));
    }

    pub async fn emit_peer_connected(&self, info: PeerInfo) {
        for handler in self.connected.read().await.iter() {
            handler(&info);
        }
        self.publish(SpvEvent::PeerConnected(info));
    }

    pub async fn emit_peer_disconnected(&self, id: PeerId, addr: SocketAddr, reason: Option<String>) {
        let key = (id, addr);
        for handler in self.disconnected.read().await.iter() {
            handler(&key);
        }
        self.publish(SpvEvent::PeerDisconnected { id, addr, reason });
    }

    fn publish(&self, event: SpvEvent) {
        // No subscribers is not an error
        let _ = self.stream.send(event);
    }
}
