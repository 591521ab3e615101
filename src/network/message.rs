//! Network message types for P2P communication
//!
//! Payload encodings for the Bitcoin wire protocol messages an SPV client
//! sends or understands. Framing lives in the codec.

use crate::core::{BlockHash, BlockHeader, BloomFilter, MerkleBlock, Transaction};
use crate::crypto::Hash256;
use crate::encode::{
    read_array, read_compact_size, read_list, read_var_str, serialize,
    write_compact_size, write_list, write_var_bytes, Decodable, Encodable, EncodeError,
};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Protocol version we speak
pub const PROTOCOL_VERSION: u32 = 70016;

/// Oldest peer version we accept (BIP37 filtering)
pub const MIN_PROTOCOL_VERSION: u32 = 70001;

/// From this version on, peers must advertise NODE_BLOOM to serve filters
pub const NO_BLOOM_VERSION: u32 = 70011;

/// Maximum payload size of a single message
pub const MAX_MESSAGE_SIZE: usize = 4_000_000;

/// Headers returned per `getheaders` request
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// Maximum entries in an inventory message
pub const MAX_INV_SIZE: u64 = 50_000;

/// Maximum hashes in a block locator
pub const MAX_LOCATOR_SIZE: u64 = 101;

/// Length of a command name on the wire
pub const COMMAND_SIZE: usize = 12;

bitflags! {
    /// Services advertised in `version`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        const NETWORK = 1;
        const GETUTXO = 1 << 1;
        const BLOOM = 1 << 2;
        const WITNESS = 1 << 3;
        const COMPACT_FILTERS = 1 << 6;
        const NETWORK_LIMITED = 1 << 10;
    }
}

/// Address of a node as carried in `version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: ServiceFlags,
    pub addr: SocketAddr,
}

impl NetworkAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self { services, addr }
    }

    /// Placeholder used when we do not know or do not want to reveal an address
    pub fn unroutable() -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            ServiceFlags::empty(),
        )
    }
}

impl Encodable for NetworkAddress {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.services.bits().consensus_encode(buf);
        let ip = match self.addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        buf.put_slice(&ip.octets());
        buf.put_u16(self.addr.port());
    }
}

impl Decodable for NetworkAddress {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let services = ServiceFlags::from_bits_retain(u64::consensus_decode(buf)?);
        let ip = Ipv6Addr::from(read_array::<_, 16>(buf)?);
        let port = u16::from_be_bytes(read_array(buf)?);
        let ip = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip),
        };
        Ok(Self::new(SocketAddr::new(ip, port), services))
    }
}

/// Opening message of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: NetworkAddress,
    pub sender: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// Whether the peer should announce transactions before a filter is loaded
    pub relay: bool,
}

impl VersionMessage {
    /// Our `version`: no services, no unfiltered relay
    pub fn new(receiver: SocketAddr, start_height: u32, nonce: u64, user_agent: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::empty(),
            timestamp: chrono::Utc::now().timestamp(),
            receiver: NetworkAddress::new(receiver, ServiceFlags::NETWORK),
            sender: NetworkAddress::unroutable(),
            nonce,
            user_agent: user_agent.to_string(),
            start_height: start_height as i32,
            relay: false,
        }
    }
}

impl Encodable for VersionMessage {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        (self.version as i32).consensus_encode(buf);
        self.services.bits().consensus_encode(buf);
        self.timestamp.consensus_encode(buf);
        self.receiver.consensus_encode(buf);
        self.sender.consensus_encode(buf);
        self.nonce.consensus_encode(buf);
        write_var_bytes(buf, self.user_agent.as_bytes());
        self.start_height.consensus_encode(buf);
        self.relay.consensus_encode(buf);
    }
}

impl Decodable for VersionMessage {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let version = i32::consensus_decode(buf)?.max(0) as u32;
        let services = ServiceFlags::from_bits_retain(u64::consensus_decode(buf)?);
        let timestamp = i64::consensus_decode(buf)?;
        let receiver = NetworkAddress::consensus_decode(buf)?;
        let sender = NetworkAddress::consensus_decode(buf)?;
        let nonce = u64::consensus_decode(buf)?;
        let user_agent = read_var_str(buf)?;
        let start_height = i32::consensus_decode(buf)?;
        // Older peers omit the relay flag
        let relay = if buf.has_remaining() {
            bool::consensus_decode(buf)?
        } else {
            true
        };
        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// Inventory object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    WitnessTx,
    WitnessBlock,
    Unknown(u32),
}

impl From<u32> for InvType {
    fn from(value: u32) -> Self {
        match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            0x4000_0001 => InvType::WitnessTx,
            0x4000_0002 => InvType::WitnessBlock,
            other => InvType::Unknown(other),
        }
    }
}

impl From<InvType> for u32 {
    fn from(value: InvType) -> Self {
        match value {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::WitnessTx => 0x4000_0001,
            InvType::WitnessBlock => 0x4000_0002,
            InvType::Unknown(other) => other,
        }
    }
}

/// One entry of `inv`, `getdata` or `notfound`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn new(inv_type: InvType, hash: Hash256) -> Self {
        Self { inv_type, hash }
    }
}

impl Encodable for InvItem {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        u32::from(self.inv_type).consensus_encode(buf);
        self.hash.consensus_encode(buf);
    }
}

impl Decodable for InvItem {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            inv_type: InvType::from(u32::consensus_decode(buf)?),
            hash: Decodable::consensus_decode(buf)?,
        })
    }
}

/// Request for headers following the locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<BlockHash>,
    /// Zero means "as many as allowed"
    pub stop_hash: BlockHash,
}

impl GetHeadersMessage {
    pub fn new(locator: Vec<BlockHash>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            locator,
            stop_hash: Hash256::ZERO,
        }
    }
}

impl Encodable for GetHeadersMessage {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        self.version.consensus_encode(buf);
        write_list(buf, &self.locator);
        self.stop_hash.consensus_encode(buf);
    }
}

impl Decodable for GetHeadersMessage {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            version: Decodable::consensus_decode(buf)?,
            locator: read_list(buf, MAX_LOCATOR_SIZE)?,
            stop_hash: Decodable::consensus_decode(buf)?,
        })
    }
}

/// Peer's explanation for refusing something we sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Hash of the rejected object, when there is one
    pub data: Vec<u8>,
}

impl Encodable for RejectMessage {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        write_var_bytes(buf, self.message.as_bytes());
        buf.put_u8(self.code);
        write_var_bytes(buf, self.reason.as_bytes());
        buf.put_slice(&self.data);
    }
}

impl Decodable for RejectMessage {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let message = read_var_str(buf)?;
        let code = u8::consensus_decode(buf)?;
        let reason = read_var_str(buf)?;
        let data = buf.copy_to_bytes(buf.remaining()).to_vec();
        Ok(Self {
            message,
            code,
            reason,
            data,
        })
    }
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    FilterLoad(BloomFilter),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    GetData(Vec<InvItem>),
    Inv(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    MerkleBlock(MerkleBlock),
    Tx(Transaction),
    Ping(u64),
    Pong(u64),
    Reject(RejectMessage),
    SendHeaders,
    /// Minimum fee rate the peer wants announced; we do not relay, so it is ignored
    FeeFilter(i64),
    /// Any command we do not understand
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    /// Command name for framing and logging
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::FilterLoad(_) => "filterload",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetData(_) => "getdata",
            Message::Inv(_) => "inv",
            Message::NotFound(_) => "notfound",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Reject(_) => "reject",
            Message::SendHeaders => "sendheaders",
            Message::FeeFilter(_) => "feefilter",
            Message::Unknown { command, .. } => command,
        }
    }

    /// Serialize the payload (without the frame header)
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Message::Version(v) => serialize(v),
            Message::Verack | Message::SendHeaders => Vec::new(),
            Message::FilterLoad(filter) => serialize(filter),
            Message::GetHeaders(getheaders) => serialize(getheaders),
            Message::Headers(headers) => {
                let mut out = Vec::with_capacity(headers.len() * 81 + 3);
                write_compact_size(&mut out, headers.len() as u64);
                for header in headers {
                    header.consensus_encode(&mut out);
                    // Headers carry an always-empty transaction count
                    out.put_u8(0);
                }
                out
            }
            Message::GetData(items) | Message::Inv(items) | Message::NotFound(items) => {
                let mut out = Vec::with_capacity(items.len() * 36 + 3);
                write_list(&mut out, items);
                out
            }
            Message::MerkleBlock(block) => serialize(block),
            Message::Tx(tx) => serialize(tx),
            Message::Ping(nonce) | Message::Pong(nonce) => serialize(nonce),
            Message::Reject(reject) => serialize(reject),
            Message::FeeFilter(rate) => serialize(rate),
            Message::Unknown { payload, .. } => payload.clone(),
        }
    }

    /// Decode a payload for `command`. The whole payload must be consumed.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, EncodeError> {
        let mut buf = payload;
        let message = match command {
            "version" => Message::Version(Decodable::consensus_decode(&mut buf)?),
            "verack" => Message::Verack,
            "filterload" => Message::FilterLoad(Decodable::consensus_decode(&mut buf)?),
            "getheaders" => Message::GetHeaders(Decodable::consensus_decode(&mut buf)?),
            "headers" => {
                let count = read_compact_size(&mut buf)?;
                if count > MAX_HEADERS_RESULTS as u64 {
                    return Err(EncodeError::OversizedVec {
                        requested: count,
                        max: MAX_HEADERS_RESULTS as u64,
                    });
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode(&mut buf)?);
                    if read_compact_size(&mut buf)? != 0 {
                        return Err(EncodeError::ParseFailed("headers entry carries transactions"));
                    }
                }
                Message::Headers(headers)
            }
            "getdata" => Message::GetData(read_list(&mut buf, MAX_INV_SIZE)?),
            "inv" => Message::Inv(read_list(&mut buf, MAX_INV_SIZE)?),
            "notfound" => Message::NotFound(read_list(&mut buf, MAX_INV_SIZE)?),
            "merkleblock" => Message::MerkleBlock(Decodable::consensus_decode(&mut buf)?),
            "tx" => Message::Tx(Decodable::consensus_decode(&mut buf)?),
            "ping" => Message::Ping(Decodable::consensus_decode(&mut buf)?),
            "pong" => Message::Pong(Decodable::consensus_decode(&mut buf)?),
            "reject" => Message::Reject(Decodable::consensus_decode(&mut buf)?),
            "sendheaders" => Message::SendHeaders,
            "feefilter" => Message::FeeFilter(Decodable::consensus_decode(&mut buf)?),
            other => {
                return Ok(Message::Unknown {
                    command: other.to_string(),
                    payload: payload.to_vec(),
                })
            }
        };

        if buf.has_remaining() {
            return Err(EncodeError::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BloomFlags, Network, NetworkParams};

    #[test]
    fn test_version_round_trip() {
        let addr: SocketAddr = "127.0.0.1:18333".parse().unwrap();
        let version = VersionMessage::new(addr, 42, 7, "/spv-node:0.1.0/");
        let decoded = Message::decode("version", &Message::Version(version.clone()).payload())
            .unwrap();
        assert_eq!(decoded, Message::Version(version));
    }

    #[test]
    fn test_version_without_relay_flag() {
        let addr: SocketAddr = "[::1]:8333".parse().unwrap();
        let mut version = VersionMessage::new(addr, 0, 1, "");
        version.relay = false;
        let mut payload = Message::Version(version).payload();
        payload.pop();

        match Message::decode("version", &payload).unwrap() {
            Message::Version(v) => {
                assert!(v.relay);
                assert_eq!(v.receiver.addr, addr);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_headers_payload() {
        let genesis = NetworkParams::new(Network::Main).genesis_header();
        let payload = Message::Headers(vec![genesis; 2]).payload();
        assert_eq!(payload.len(), 1 + 2 * 81);
        assert_eq!(
            Message::decode("headers", &payload).unwrap(),
            Message::Headers(vec![genesis; 2])
        );
    }

    #[test]
    fn test_too_many_headers_rejected() {
        let mut payload = Vec::new();
        write_compact_size(&mut payload, MAX_HEADERS_RESULTS as u64 + 1);
        assert!(matches!(
            Message::decode("headers", &payload),
            Err(EncodeError::OversizedVec { .. })
        ));
    }

    #[test]
    fn test_inv_types() {
        let items = vec![
            InvItem::new(InvType::Tx, Hash256::hash(b"a")),
            InvItem::new(InvType::FilteredBlock, Hash256::hash(b"b")),
            InvItem::new(InvType::Unknown(9), Hash256::hash(b"c")),
        ];
        let payload = Message::GetData(items.clone()).payload();
        assert_eq!(payload.len(), 1 + 3 * 36);
        assert_eq!(Message::decode("getdata", &payload).unwrap(), Message::GetData(items));
    }

    #[test]
    fn test_filterload_payload() {
        let filter = BloomFilter::build([b"x"], 0.01, 3, BloomFlags::None).unwrap();
        let payload = Message::FilterLoad(filter.clone()).payload();
        assert_eq!(
            Message::decode("filterload", &payload).unwrap(),
            Message::FilterLoad(filter)
        );
    }

    #[test]
    fn test_unknown_command_kept() {
        let decoded = Message::decode("sendcmpct", &[0, 1, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(decoded.command(), "sendcmpct");
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert_eq!(
            Message::decode("ping", &[0u8; 9]),
            Err(EncodeError::TrailingBytes(1))
        );
        assert!(Message::decode("pong", &[0u8; 3]).is_err());
    }

    #[test]
    fn test_reject_keeps_data() {
        let reject = RejectMessage {
            message: "tx".into(),
            code: 0x10,
            reason: "bad-txns".into(),
            data: vec![0xab; 32],
        };
        let payload = Message::Reject(reject.clone()).payload();
        assert_eq!(Message::decode("reject", &payload).unwrap(), Message::Reject(reject));
    }
}
