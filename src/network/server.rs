//! TCP server and connection handling
//!
//! Frames Bitcoin wire messages and runs one task per peer connection. The
//! task owns the peer's `Peer` state machine and reports to the event loop
//! through `NetEvent`s.

use crate::core::NetworkParams;
use crate::crypto::double_sha256;
use crate::network::message::{Message, COMMAND_SIZE, MAX_MESSAGE_SIZE};
use crate::network::peer::{Peer, PeerAction, PeerError, PeerInfo};
use crate::network::pool::{NetEvent, PeerCommand, PeerLink};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// magic + command + length + checksum
pub const FRAME_HEADER_SIZE: usize = 24;

/// Interval between keepalive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(120);

/// Default time allowed for a peer to complete the handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bitcoin P2P framing for one network
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    magic: [u8; 4],
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Command names are ASCII, NUL padded, with nothing after the padding
fn parse_command(raw: &[u8]) -> Result<String, PeerError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(end);
    if padding.iter().any(|&b| b != 0) || !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(PeerError::Violation(format!(
            "invalid command field {}",
            hex::encode(raw)
        )));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = item.command();
        if command.len() > COMMAND_SIZE {
            return Err(PeerError::Violation(format!(
                "command {} is too long to send",
                command
            )));
        }
        let payload = item.payload();
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(PeerError::OversizedPayload(payload.len()));
        }

        let mut name = [0u8; COMMAND_SIZE];
        name[..command.len()].copy_from_slice(command.as_bytes());

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&name);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        if src[..4] != self.magic {
            return Err(PeerError::BadMagic([src[0], src[1], src[2], src[3]]));
        }

        let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(PeerError::OversizedPayload(len));
        }

        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let command = parse_command(&src[4..16])?;
        let expected = [src[20], src[21], src[22], src[23]];
        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(len);

        if checksum(&payload) != expected {
            return Err(PeerError::BadChecksum(command));
        }

        Message::decode(&command, &payload)
            .map(Some)
            .map_err(|source| PeerError::Malformed { command, source })
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port and create the server
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Listening for peers on port {}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, PeerError> {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(PeerError::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(PeerError::Timeout("connect")),
    }
}

/// What every session needs to know about the local node
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub params: NetworkParams,
    pub user_agent: String,
    pub start_height: u32,
    /// Nonce for our `version`, shared by every connection of this node
    pub local_nonce: u64,
    pub handshake_timeout: Duration,
}

type PeerWriter = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type PeerReader = SplitStream<Framed<TcpStream, MessageCodec>>;

/// Run a peer connection until it closes (both inbound and outbound).
///
/// `ready` fires once the handshake completes and the filter is loaded, or
/// with the error that ended the connection first.
pub async fn handle_connection(
    stream: TcpStream,
    mut link: PeerLink,
    session: SessionConfig,
    events: mpsc::Sender<NetEvent>,
    mut ready: Option<oneshot::Sender<Result<PeerInfo, PeerError>>>,
) {
    let framed = Framed::new(stream, MessageCodec::new(session.params.magic));
    let (mut writer, mut reader) = framed.split();
    let mut peer = Peer::new(link.id, link.addr, link.outbound, session.local_nonce);

    // An abort must win even while the session is parked on a write
    let close = link.close.clone();
    let result = tokio::select! {
        result = run_session(
            &mut peer,
            &mut writer,
            &mut reader,
            &mut link,
            &session,
            &events,
            &mut ready,
        ) => result,
        _ = close.notified() => Err(PeerError::Aborted),
    };

    peer.disconnect();
    link.info.send_replace(peer.info());

    match &result {
        Ok(()) => log::info!("Peer {} ({}) disconnected", link.id, link.addr),
        Err(e) if e.is_misbehavior() => {
            log::warn!("Peer {} ({}) misbehaved: {}", link.id, link.addr, e)
        }
        Err(e) => log::info!("Peer {} ({}) dropped: {}", link.id, link.addr, e),
    }

    if let Some(ready) = ready.take() {
        let reason = match &result {
            Ok(()) => PeerError::Disconnected,
            Err(e) => PeerError::ConnectionFailed(e.to_string()),
        };
        let _ = ready.send(Err(reason));
    }

    let _ = events
        .send(NetEvent::Closed {
            id: link.id,
            addr: link.addr,
            error: result.err(),
        })
        .await;
}

async fn run_session(
    peer: &mut Peer,
    writer: &mut PeerWriter,
    reader: &mut PeerReader,
    link: &mut PeerLink,
    session: &SessionConfig,
    events: &mpsc::Sender<NetEvent>,
    ready: &mut Option<oneshot::Sender<Result<PeerInfo, PeerError>>>,
) -> Result<(), PeerError> {
    let version = peer.on_connected(session.start_height, &session.user_agent);
    writer.send(version).await?;
    link.info.send_replace(peer.info());
    log::debug!("Sent version to {}", link.addr);

    let handshake_deadline = time::sleep(session.handshake_timeout);
    tokio::pin!(handshake_deadline);
    let mut ping = time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            frame = reader.next() => {
                let msg = match frame {
                    Some(frame) => frame?,
                    None => return Ok(()),
                };
                log::debug!("Received {} from {}", msg.command(), link.addr);

                match peer.handle_message(msg)? {
                    PeerAction::Reply(reply) => writer.send(reply).await?,
                    PeerAction::Ready => {
                        let filter = link.filter.borrow_and_update().clone();
                        writer.send(peer.load_filter(filter)?).await?;
                        let info = peer.info();
                        link.info.send_replace(info.clone());
                        log::info!("Peer {} ({}) ready, filter loaded", link.id, link.addr);

                        if let Some(ready) = ready.take() {
                            let _ = ready.send(Ok(info.clone()));
                        }
                        events
                            .send(NetEvent::Ready { id: link.id, info })
                            .await
                            .map_err(|_| PeerError::Disconnected)?;
                    }
                    PeerAction::Forward(message) => {
                        events
                            .send(NetEvent::Message { id: link.id, message })
                            .await
                            .map_err(|_| PeerError::Disconnected)?;
                    }
                    PeerAction::Ignore => {}
                }
                link.info.send_replace(peer.info());
            }

            command = link.commands.recv() => match command {
                Some(PeerCommand::Send(msg)) => {
                    log::debug!("Sending {} to {}", msg.command(), link.addr);
                    writer.send(msg).await?;
                }
                Some(PeerCommand::BeginSync) => {
                    peer.begin_sync()?;
                    link.info.send_replace(peer.info());
                }
                Some(PeerCommand::Disconnect) | None => return Ok(()),
            },

            changed = link.filter.changed(), if peer.is_filtered() => {
                if changed.is_err() {
                    return Ok(());
                }
                let filter = link.filter.borrow_and_update().clone();
                writer.send(peer.load_filter(filter)?).await?;
                link.info.send_replace(peer.info());
                log::debug!("Reloaded filter on peer {} ({})", link.id, link.addr);
                events
                    .send(NetEvent::FilterReloaded { id: link.id })
                    .await
                    .map_err(|_| PeerError::Disconnected)?;
            }

            _ = &mut handshake_deadline, if !peer.is_handshaken() => {
                return Err(PeerError::Timeout("handshake"));
            }

            _ = ping.tick() => {
                if peer.awaiting_pong() {
                    return Err(PeerError::Timeout("pong"));
                }
                if let Some(msg) = peer.next_ping() {
                    writer.send(msg).await?;
                }
            }
        }
    }
}
