//! Wire messages for the UDP discovery protocol.
//!
//! Message types:
//! - PING (0x01): Liveness probe carrying both endpoints
//! - PONG (0x02): Response to PING, echoes the PING packet hash
//! - FINDNEIGHBOURS (0x03): Request nodes close to a target ID
//! - NEIGHBOURS (0x04): Response with a list of peer records
//!
//! Packet format:
//! - hash (32 bytes): keccak256 over everything after itself
//! - signature (64 bytes) + recovery id (1 byte)
//! - message type (1 byte)
//! - RLP payload (variable)
//!
//! The signature covers (message_type || payload); the sender's node ID is
//! recovered from it, so packets carry no explicit sender field.

use std::net::{IpAddr, SocketAddr};

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};

use kadmos_common::crypto::{
    keccak256, keccak256_concat, recover_public_key, Hash, NodeId, NodeIdentity, HASH_SIZE,
    SIGNATURE_SIZE,
};
use kadmos_common::time::get_current_time_in_seconds;

use crate::config::{
    DPT_PROTOCOL_VERSION, MAX_DATAGRAM_SIZE, NEIGHBOURS_MAX_PER_PACKET, PACKET_EXPIRY_WINDOW,
    PACKET_MAX_CLOCK_DRIFT,
};
use crate::error::DiscoveryError;

/// Message type identifiers.
pub mod message_type {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const FINDNEIGHBOURS: u8 = 0x03;
    pub const NEIGHBOURS: u8 = 0x04;
}

/// Bytes preceding the RLP payload: hash, signature with recovery id, type.
pub const PACKET_HEAD_SIZE: usize = HASH_SIZE + SIGNATURE_SIZE + 1;

/// Smallest decodable packet (head plus one RLP byte).
pub const PACKET_MIN_SIZE: usize = PACKET_HEAD_SIZE + 1;

/// Network endpoint of a node. Ports are optional on the wire; a node
/// behind a NAT may advertise neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address (v4 or v6).
    pub address: IpAddr,
    /// Discovery (UDP) port.
    pub udp_port: Option<u16>,
    /// Transport (TCP) port.
    pub tcp_port: Option<u16>,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(address: IpAddr, udp_port: Option<u16>, tcp_port: Option<u16>) -> Self {
        Self {
            address,
            udp_port,
            tcp_port,
        }
    }

    /// Endpoint derived from an observed UDP source address.
    pub fn from_udp_addr(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip(),
            udp_port: Some(addr.port()),
            tcp_port: None,
        }
    }

    /// Socket address for discovery traffic, if the UDP port is known.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_port.map(|port| SocketAddr::new(self.address, port))
    }

    /// Socket address for transport connections, if the TCP port is known.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_port.map(|port| SocketAddr::new(self.address, port))
    }
}

impl Encodable for Endpoint {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&encode_address(&self.address));
        s.append(&encode_port(self.udp_port));
        s.append(&encode_port(self.tcp_port));
    }
}

impl Decodable for Endpoint {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? < 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let address = decode_address(rlp.at(0)?.data()?)?;
        let udp_port = decode_port(rlp.at(1)?.data()?)?;
        let tcp_port = decode_port(rlp.at(2)?.data()?)?;
        Ok(Self {
            address,
            udp_port,
            tcp_port,
        })
    }
}

/// A discovered node: its ID plus the endpoint it was observed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Node ID (uncompressed public key without the SEC1 prefix).
    pub id: NodeId,
    /// Last known endpoint.
    pub endpoint: Endpoint,
}

impl PeerRecord {
    /// Create a new peer record.
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }

    /// Socket address for discovery traffic, if known.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.endpoint.udp_addr()
    }

    /// Socket address for transport connections, if known.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.endpoint.tcp_addr()
    }
}

impl Encodable for PeerRecord {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&encode_address(&self.endpoint.address));
        s.append(&encode_port(self.endpoint.udp_port));
        s.append(&encode_port(self.endpoint.tcp_port));
        s.append(&self.id.as_bytes().to_vec());
    }
}

impl Decodable for PeerRecord {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? < 4 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let address = decode_address(rlp.at(0)?.data()?)?;
        let udp_port = decode_port(rlp.at(1)?.data()?)?;
        let tcp_port = decode_port(rlp.at(2)?.data()?)?;
        let id = NodeId::try_from(rlp.at(3)?.data()?)
            .map_err(|_| DecoderError::Custom("invalid node id length"))?;
        Ok(Self {
            id,
            endpoint: Endpoint {
                address,
                udp_port,
                tcp_port,
            },
        })
    }
}

/// PING message for liveness checks and endpoint exchange.
#[derive(Debug, Clone)]
pub struct Ping {
    /// Discovery protocol version.
    pub version: u32,
    /// Sender endpoint as the sender sees it.
    pub from: Endpoint,
    /// Recipient endpoint as the sender sees it.
    pub to: Endpoint,
    /// Validity postmark (Unix seconds).
    pub timestamp: u64,
}

impl Ping {
    /// Create a new PING message.
    pub fn new(from: Endpoint, to: Endpoint) -> Self {
        Self {
            version: DPT_PROTOCOL_VERSION as u32,
            from,
            to,
            timestamp: future_timestamp(),
        }
    }
}

impl Encodable for Ping {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&vec![self.version as u8]);
        s.append(&self.from);
        s.append(&self.to);
        s.append(&encode_timestamp(self.timestamp));
    }
}

impl Decodable for Ping {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? < 4 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let version = decode_uint(rlp.at(0)?.data()?, 4)? as u32;
        let from = rlp.at(1)?.as_val()?;
        let to = rlp.at(2)?.as_val()?;
        let timestamp = decode_uint(rlp.at(3)?.data()?, 8)?;
        Ok(Self {
            version,
            from,
            to,
            timestamp,
        })
    }
}

/// PONG message as response to PING.
#[derive(Debug, Clone)]
pub struct Pong {
    /// Recipient endpoint as the sender sees it.
    pub to: Endpoint,
    /// Hash of the PING packet this responds to.
    pub echoed_hash: Hash,
    /// Validity postmark (Unix seconds).
    pub timestamp: u64,
}

impl Pong {
    /// Create a new PONG message.
    pub fn new(to: Endpoint, echoed_hash: Hash) -> Self {
        Self {
            to,
            echoed_hash,
            timestamp: future_timestamp(),
        }
    }
}

impl Encodable for Pong {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.to);
        s.append(&self.echoed_hash.as_bytes().to_vec());
        s.append(&encode_timestamp(self.timestamp));
    }
}

impl Decodable for Pong {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? < 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let to = rlp.at(0)?.as_val()?;
        let echoed_hash = Hash::try_from(rlp.at(1)?.data()?)
            .map_err(|_| DecoderError::Custom("invalid hash length"))?;
        let timestamp = decode_uint(rlp.at(2)?.data()?, 8)?;
        Ok(Self {
            to,
            echoed_hash,
            timestamp,
        })
    }
}

/// FINDNEIGHBOURS message requesting nodes close to a target ID.
#[derive(Debug, Clone)]
pub struct FindNeighbours {
    /// Target node ID to find nodes close to.
    pub target: NodeId,
    /// Validity postmark (Unix seconds).
    pub timestamp: u64,
}

impl FindNeighbours {
    /// Create a new FINDNEIGHBOURS message.
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            timestamp: future_timestamp(),
        }
    }
}

impl Encodable for FindNeighbours {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.target.as_bytes().to_vec());
        s.append(&encode_timestamp(self.timestamp));
    }
}

impl Decodable for FindNeighbours {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? < 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let target = NodeId::try_from(rlp.at(0)?.data()?)
            .map_err(|_| DecoderError::Custom("invalid node id length"))?;
        let timestamp = decode_uint(rlp.at(1)?.data()?, 8)?;
        Ok(Self { target, timestamp })
    }
}

/// NEIGHBOURS message carrying a chunk of peer records.
#[derive(Debug, Clone)]
pub struct Neighbours {
    /// Peer records (at most [`NEIGHBOURS_MAX_PER_PACKET`]).
    pub records: Vec<PeerRecord>,
    /// Validity postmark (Unix seconds).
    pub timestamp: u64,
}

impl Neighbours {
    /// Create a new NEIGHBOURS message, truncated to the per-packet cap
    /// so the datagram stays under the size limit.
    pub fn new(mut records: Vec<PeerRecord>) -> Self {
        records.truncate(NEIGHBOURS_MAX_PER_PACKET);
        Self {
            records,
            timestamp: future_timestamp(),
        }
    }
}

impl Encodable for Neighbours {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append_list(&self.records);
        s.append(&encode_timestamp(self.timestamp));
    }
}

impl Decodable for Neighbours {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? < 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let records = rlp.at(0)?.as_list()?;
        let timestamp = decode_uint(rlp.at(1)?.data()?, 8)?;
        Ok(Self { records, timestamp })
    }
}

/// Discovery message types.
#[derive(Debug, Clone)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNeighbours(FindNeighbours),
    Neighbours(Neighbours),
}

impl Message {
    /// Get the message type ID.
    pub fn message_type(&self) -> u8 {
        match self {
            Message::Ping(_) => message_type::PING,
            Message::Pong(_) => message_type::PONG,
            Message::FindNeighbours(_) => message_type::FINDNEIGHBOURS,
            Message::Neighbours(_) => message_type::NEIGHBOURS,
        }
    }

    /// Get the validity postmark.
    pub fn timestamp(&self) -> u64 {
        match self {
            Message::Ping(m) => m.timestamp,
            Message::Pong(m) => m.timestamp,
            Message::FindNeighbours(m) => m.timestamp,
            Message::Neighbours(m) => m.timestamp,
        }
    }

    /// Check the validity postmark against the local clock.
    ///
    /// The postmark must be in the future (the sender stamps it ahead of
    /// send time) but not so far ahead that a captured packet could be
    /// replayed much later.
    pub fn validate_expiration(&self) -> Result<(), DiscoveryError> {
        let now = get_current_time_in_seconds();
        let timestamp = self.timestamp();
        if timestamp <= now {
            return Err(DiscoveryError::Expired(timestamp, now));
        }
        if timestamp > now.saturating_add(PACKET_MAX_CLOCK_DRIFT) {
            return Err(DiscoveryError::ClockDrift(timestamp, now));
        }
        Ok(())
    }

    fn rlp_append(&self, s: &mut RlpStream) {
        match self {
            Message::Ping(m) => m.rlp_append(s),
            Message::Pong(m) => m.rlp_append(s),
            Message::FindNeighbours(m) => m.rlp_append(s),
            Message::Neighbours(m) => m.rlp_append(s),
        }
    }

    fn decode(msg_type: u8, payload: &[u8]) -> Result<Self, DiscoveryError> {
        let rlp = Rlp::new(payload);
        // Reject trailing bytes after the payload list so two parsers can
        // never disagree about what was signed.
        let info = rlp.payload_info()?;
        if info.header_len + info.value_len != payload.len() {
            return Err(DiscoveryError::Malformed(
                DecoderError::RlpInconsistentLengthAndData,
            ));
        }
        match msg_type {
            message_type::PING => Ok(Message::Ping(Ping::decode(&rlp)?)),
            message_type::PONG => Ok(Message::Pong(Pong::decode(&rlp)?)),
            message_type::FINDNEIGHBOURS => {
                Ok(Message::FindNeighbours(FindNeighbours::decode(&rlp)?))
            }
            message_type::NEIGHBOURS => Ok(Message::Neighbours(Neighbours::decode(&rlp)?)),
            _ => Err(DiscoveryError::UnknownPacketType(msg_type)),
        }
    }

    /// Encode and sign this message into a datagram.
    ///
    /// Returns the packet bytes and the packet hash a PONG would echo.
    pub fn encode(&self, identity: &NodeIdentity) -> Result<(Vec<u8>, Hash), DiscoveryError> {
        let mut stream = RlpStream::new();
        self.rlp_append(&mut stream);
        let payload = stream.out();

        let mut typed = Vec::with_capacity(1 + payload.len());
        typed.push(self.message_type());
        typed.extend_from_slice(&payload);

        let sig_hash = keccak256(&typed);
        let signature = identity.sign_recoverable(&sig_hash)?;
        let hash = keccak256_concat(&[&signature[..], &typed[..]]);

        let mut packet = Vec::with_capacity(HASH_SIZE + SIGNATURE_SIZE + typed.len());
        packet.extend_from_slice(hash.as_bytes());
        packet.extend_from_slice(&signature);
        packet.extend_from_slice(&typed);
        Ok((packet, hash))
    }
}

/// A verified inbound message with its recovered sender.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The decoded message.
    pub message: Message,
    /// Sender node ID recovered from the signature.
    pub node_id: NodeId,
    /// Hash of the whole packet (echoed by PONG).
    pub hash: Hash,
}

impl ReceivedMessage {
    /// Decode and verify a datagram.
    ///
    /// Verification order: size bounds, then the self-consistency hash
    /// byte for byte, then signature recovery, then payload decoding and
    /// the postmark window. Anything that fails drops the packet.
    pub fn decode(data: &[u8]) -> Result<Self, DiscoveryError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_DATAGRAM_SIZE));
        }
        if data.len() < PACKET_MIN_SIZE {
            return Err(DiscoveryError::Truncated(data.len()));
        }

        let hash = keccak256(&data[HASH_SIZE..]);
        if hash.as_bytes()[..] != data[..HASH_SIZE] {
            return Err(DiscoveryError::HashMismatch);
        }

        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&data[HASH_SIZE..HASH_SIZE + SIGNATURE_SIZE]);

        let typed = &data[HASH_SIZE + SIGNATURE_SIZE..];
        let sig_hash = keccak256(typed);
        let public_key = recover_public_key(&sig_hash, &signature)?;
        let node_id = NodeId::from_public_key(&public_key);

        let message = Message::decode(typed[0], &typed[1..])?;
        message.validate_expiration()?;

        Ok(Self {
            message,
            node_id,
            hash,
        })
    }
}

/// Postmark for outbound messages: far enough ahead to survive transit.
fn future_timestamp() -> u64 {
    get_current_time_in_seconds().saturating_add(PACKET_EXPIRY_WINDOW)
}

fn encode_address(address: &IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn decode_address(data: &[u8]) -> Result<IpAddr, DecoderError> {
    match data.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(data);
            Ok(IpAddr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(data);
            Ok(IpAddr::from(octets))
        }
        _ => Err(DecoderError::Custom("invalid address length")),
    }
}

/// Ports are two big-endian bytes on the wire, or empty when absent.
fn encode_port(port: Option<u16>) -> Vec<u8> {
    match port {
        Some(port) => port.to_be_bytes().to_vec(),
        None => Vec::new(),
    }
}

fn decode_port(data: &[u8]) -> Result<Option<u16>, DecoderError> {
    if data.is_empty() {
        return Ok(None);
    }
    let value = decode_uint(data, 2)?;
    Ok(Some(value as u16))
}

/// Timestamps are four big-endian bytes on the wire.
fn encode_timestamp(timestamp: u64) -> Vec<u8> {
    (timestamp as u32).to_be_bytes().to_vec()
}

/// Big-endian integer of bounded width. Accepts shorter encodings.
fn decode_uint(data: &[u8], max_len: usize) -> Result<u64, DecoderError> {
    if data.len() > max_len {
        return Err(DecoderError::Custom("integer field too long"));
    }
    let mut value = 0u64;
    for byte in data {
        value = (value << 8) | u64::from(*byte);
    }
    Ok(value)
}
