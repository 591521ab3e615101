//! Peer session state machine
//!
//! A `Peer` tracks one connection's handshake and sync progress. It is pure
//! bookkeeping: the connection task feeds it decoded messages and acts on
//! the returned `PeerAction`, so every protocol rule here is testable
//! without a socket.

use crate::core::BloomFilter;
use crate::crypto::MerkleError;
use crate::encode::EncodeError;
use crate::network::message::{
    Message, ServiceFlags, VersionMessage, MIN_PROTOCOL_VERSION, NO_BLOOM_VERSION,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Identifier assigned to each connection attempt
pub type PeerId = u64;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("{0} is in its reconnect backoff window")]
    Backoff(SocketAddr),
    #[error("{0} is banned")]
    Banned(SocketAddr),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Peer stopped draining its command queue")]
    Stalled,
    #[error("Connection aborted")]
    Aborted,
    #[error("Wrong network magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("Checksum mismatch for {0}")]
    BadChecksum(String),
    #[error("Payload of {0} bytes exceeds the maximum")]
    OversizedPayload(usize),
    #[error("Malformed {command} message: {source}")]
    Malformed {
        command: String,
        source: EncodeError,
    },
    #[error("Protocol violation: {0}")]
    Violation(String),
    #[error("Peer version {0} is too old")]
    IncompatibleVersion(u32),
    #[error("Peer lacks required services {0:?}")]
    MissingServices(ServiceFlags),
    #[error("Connected to ourselves")]
    SelfConnection,
    #[error("Invalid merkle proof: {0}")]
    InvalidProof(#[from] MerkleError),
}

impl PeerError {
    /// Whether the error is the peer's fault and should get it banned
    pub fn is_misbehavior(&self) -> bool {
        matches!(
            self,
            PeerError::BadMagic(_)
                | PeerError::BadChecksum(_)
                | PeerError::OversizedPayload(_)
                | PeerError::Malformed { .. }
                | PeerError::Violation(_)
                | PeerError::InvalidProof(_)
        )
    }
}

/// Handshake and session progress, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PeerState {
    Connecting,
    VersionSent,
    VersionReceived,
    VerackExchanged,
    FilterLoaded,
    Synced,
    Disconnected,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the connection task should do with an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    /// Send this message back to the peer
    Reply(Message),
    /// The handshake just completed
    Ready,
    /// Hand the message to the sync engine
    Forward(Message),
    /// Nothing to do
    Ignore,
}

/// Information about a peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Peer's address
    pub addr: SocketAddr,
    /// Whether this is an outbound connection
    pub outbound: bool,
    /// Connection state
    pub state: PeerState,
    /// Negotiated protocol version (0 until the peer's version arrives)
    pub version: u32,
    pub services: ServiceFlags,
    /// Peer's user agent
    pub user_agent: String,
    /// Peer's chain height when it connected
    pub start_height: i32,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Protocol state for one connection
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    outbound: bool,
    state: PeerState,
    /// Nonce we put in our own `version`, to detect self-connections
    local_nonce: u64,
    remote: Option<VersionMessage>,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    pending_ping: Option<u64>,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, outbound: bool, local_nonce: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            addr,
            outbound,
            state: PeerState::Connecting,
            local_nonce,
            remote: None,
            connected_at: now,
            last_seen: now,
            pending_ping: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// The peer's `version`, once received
    pub fn remote_version(&self) -> Option<&VersionMessage> {
        self.remote.as_ref()
    }

    /// Handshake complete and not yet disconnected
    pub fn is_handshaken(&self) -> bool {
        self.state >= PeerState::VerackExchanged && self.state != PeerState::Disconnected
    }

    /// Filter loaded; data messages are acceptable
    pub fn is_filtered(&self) -> bool {
        matches!(self.state, PeerState::FilterLoaded | PeerState::Synced)
    }

    pub fn info(&self) -> PeerInfo {
        let remote = self.remote.as_ref();
        PeerInfo {
            id: self.id,
            addr: self.addr,
            outbound: self.outbound,
            state: self.state,
            version: remote.map(|v| v.version).unwrap_or(0),
            services: remote.map(|v| v.services).unwrap_or_default(),
            user_agent: remote.map(|v| v.user_agent.clone()).unwrap_or_default(),
            start_height: remote.map(|v| v.start_height).unwrap_or(0),
            connected_at: self.connected_at,
            last_seen: self.last_seen,
        }
    }

    /// Transport is up: move to VersionSent and return our `version`
    pub fn on_connected(&mut self, start_height: u32, user_agent: &str) -> Message {
        self.state = PeerState::VersionSent;
        Message::Version(VersionMessage::new(
            self.addr,
            start_height,
            self.local_nonce,
            user_agent,
        ))
    }

    /// Apply an inbound message to the state machine
    pub fn handle_message(&mut self, msg: Message) -> Result<PeerAction, PeerError> {
        self.last_seen = Utc::now();

        match msg {
            Message::Version(version) => self.on_version(version),
            Message::Verack => {
                if self.state != PeerState::VersionReceived {
                    return Err(self.violation("verack"));
                }
                self.state = PeerState::VerackExchanged;
                Ok(PeerAction::Ready)
            }
            Message::Ping(nonce) => {
                self.require_handshake("ping")?;
                Ok(PeerAction::Reply(Message::Pong(nonce)))
            }
            Message::Pong(nonce) => {
                self.require_handshake("pong")?;
                if self.pending_ping == Some(nonce) {
                    self.pending_ping = None;
                }
                Ok(PeerAction::Ignore)
            }
            Message::MerkleBlock(_) | Message::Tx(_) => {
                if !self.is_filtered() {
                    return Err(self.violation(msg.command()));
                }
                Ok(PeerAction::Forward(msg))
            }
            Message::Headers(_) | Message::Inv(_) | Message::NotFound(_) => {
                self.require_handshake(msg.command())?;
                Ok(PeerAction::Forward(msg))
            }
            Message::Reject(reject) => {
                log::warn!(
                    "Peer {} ({}) rejected {}: code {:#04x} {}",
                    self.id,
                    self.addr,
                    reject.message,
                    reject.code,
                    reject.reason
                );
                Ok(PeerAction::Ignore)
            }
            Message::Unknown { ref command, .. } => {
                if self.remote.is_none() {
                    return Err(self.violation(command));
                }
                log::debug!("Ignoring unknown command {} from {}", command, self.addr);
                Ok(PeerAction::Ignore)
            }
            // Requests for data we do not serve, and relay policy we do not apply
            Message::SendHeaders
            | Message::FeeFilter(_)
            | Message::GetHeaders(_)
            | Message::GetData(_)
            | Message::FilterLoad(_) => {
                self.require_handshake(msg.command())?;
                Ok(PeerAction::Ignore)
            }
        }
    }

    fn on_version(&mut self, version: VersionMessage) -> Result<PeerAction, PeerError> {
        if self.state != PeerState::VersionSent {
            return Err(self.violation("version"));
        }
        if version.nonce == self.local_nonce {
            return Err(PeerError::SelfConnection);
        }
        if version.version < MIN_PROTOCOL_VERSION {
            return Err(PeerError::IncompatibleVersion(version.version));
        }

        let mut required = ServiceFlags::NETWORK;
        if version.version >= NO_BLOOM_VERSION {
            required |= ServiceFlags::BLOOM;
        }
        if !version.services.contains(required) {
            return Err(PeerError::MissingServices(required - version.services));
        }

        log::info!(
            "Peer {} ({}) version {} {} height {}",
            self.id,
            self.addr,
            version.version,
            version.user_agent,
            version.start_height
        );
        self.remote = Some(version);
        self.state = PeerState::VersionReceived;
        Ok(PeerAction::Reply(Message::Verack))
    }

    /// Send (or resend) the bloom filter. Valid once the handshake is done.
    pub fn load_filter(&mut self, filter: BloomFilter) -> Result<Message, PeerError> {
        if !self.is_handshaken() {
            return Err(PeerError::Violation(format!(
                "cannot load filter in state {}",
                self.state
            )));
        }
        self.state = PeerState::FilterLoaded;
        Ok(Message::FilterLoad(filter))
    }

    /// A sync session was started for this peer
    pub fn begin_sync(&mut self) -> Result<(), PeerError> {
        match self.state {
            PeerState::FilterLoaded | PeerState::Synced => {
                self.state = PeerState::Synced;
                Ok(())
            }
            state => Err(PeerError::Violation(format!(
                "cannot start sync in state {}",
                state
            ))),
        }
    }

    /// Keepalive ping; returns `None` if the previous one is still unanswered
    pub fn next_ping(&mut self) -> Option<Message> {
        if self.pending_ping.is_some() || !self.is_handshaken() {
            return None;
        }
        let nonce = rand::random();
        self.pending_ping = Some(nonce);
        Some(Message::Ping(nonce))
    }

    /// Whether a keepalive ping is outstanding
    pub fn awaiting_pong(&self) -> bool {
        self.pending_ping.is_some()
    }

    pub fn disconnect(&mut self) {
        self.state = PeerState::Disconnected;
    }

    fn require_handshake(&self, command: &str) -> Result<(), PeerError> {
        if self.is_handshaken() {
            Ok(())
        } else {
            Err(self.violation(command))
        }
    }

    fn violation(&self, command: &str) -> PeerError {
        PeerError::Violation(format!("unexpected {} in state {}", command, self.state))
    }
}
