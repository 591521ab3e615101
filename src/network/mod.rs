//! P2P networking module
//!
//! Speaks the Bitcoin wire protocol as a BIP37 light client.
//!
//! # Features
//! - Framed TCP connections, one task per peer
//! - Version/verack handshake and bloom filter loading
//! - Header-first sync with filtered block download
//! - Connection limits, reconnect backoff and session bans
//! - Event delivery to the consumer

pub mod events;
pub mod message;
pub mod node;
pub mod peer;
pub mod pool;
pub mod server;
pub mod sync;

pub use events::{BlockEvent, EventBus, SpvEvent, TransactionEvent};
pub use message::{
    GetHeadersMessage, InvItem, InvType, Message, NetworkAddress, RejectMessage, ServiceFlags,
    VersionMessage, MAX_HEADERS_RESULTS, MAX_MESSAGE_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use node::{ConnectHandle, Health, NodeConfig, NodeStatus, SpvNode};
pub use peer::{Peer, PeerAction, PeerError, PeerId, PeerInfo, PeerState};
pub use pool::{NetEvent, PeerCommand, PeerHandle, PeerPool, PoolConfig, MAX_INBOUND, MAX_OUTBOUND};
pub use server::{connect_to_peer, MessageCodec, Server};
pub use sync::{SyncCursor, SyncEngine};
