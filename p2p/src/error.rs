//! Error types for the discovery and transport subsystems.

use std::io::Error as IoError;
use std::net::SocketAddr;

use thiserror::Error;

use kadmos_common::crypto::{CryptoError, NodeId};

/// Failures during the ECIES handshake. Fatal to the single connection;
/// the dialing side bans the remote address afterwards.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Envelope or signature crypto failure.
    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Auth plaintext had an unexpected size.
    #[error("Invalid auth plaintext of {0} bytes")]
    InvalidAuthSize(usize),

    /// Ack plaintext had an unexpected size.
    #[error("Invalid ack plaintext of {0} bytes")]
    InvalidAckSize(usize),

    /// The reserved trailing byte of a handshake plaintext was non-zero.
    #[error("Non-zero trailing byte in handshake plaintext")]
    TrailingByte,

    /// Recovered ephemeral key does not match the transmitted hash.
    #[error("Ephemeral key hash mismatch")]
    EphemeralHashMismatch,

    /// Frame keys requested before both handshake halves completed.
    #[error("Handshake is not complete")]
    Incomplete,
}

/// Post-handshake framing violations. Fatal to the connection.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Header mac mismatch")]
    HeaderMacMismatch,

    #[error("Body mac mismatch")]
    BodyMacMismatch,

    /// Declared body size above the configured cap, or a body whose wire
    /// length does not match its header.
    #[error("Invalid frame body size: {0} bytes (limit {1})")]
    InvalidBodySize(usize, usize),

    /// A body was handed to the session with no parsed header.
    #[error("Frame body received before its header")]
    BodyBeforeHeader,
}

/// Violations of the negotiated message protocol. These trigger a
/// DISCONNECT with a matching reason, never a crash.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("No shared capability")]
    NoSharedCapability,

    #[error("Malformed message: {0}")]
    Malformed(#[from] rlp::DecoderError),

    #[error("Empty message body")]
    EmptyBody,

    /// A send was attempted with a code outside the capability's range.
    #[error("Message code {0} out of range")]
    CodeOutOfRange(u8),

    /// Something other than HELLO or DISCONNECT arrived during setup.
    #[error("Unexpected message code {0} during session setup")]
    UnexpectedMessage(u8),

    /// HELLO carried a node id that differs from the handshake identity.
    #[error("HELLO identity does not match the handshake identity")]
    UnexpectedIdentity,

    /// The remote authenticated with our own key pair.
    #[error("Peer presented our own identity")]
    SameIdentity,
}

/// Problems with a single discovery datagram. The datagram is dropped and
/// the service keeps running.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Self-consistency hash did not match the packet contents.
    #[error("Packet hash mismatch")]
    HashMismatch,

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Truncated packet of {0} bytes")]
    Truncated(usize),

    #[error("Packet too large: {0} bytes exceeds {1}")]
    PacketTooLarge(usize, usize),

    /// Expiry postmark in the past.
    #[error("Packet expired: postmark {0}, now {1}")]
    Expired(u64, u64),

    /// Postmark too far in the future to be explained by clock drift.
    #[error("Packet postmarked too far ahead: {0}, now {1}")]
    ClockDrift(u64, u64),

    #[error("Malformed payload: {0}")]
    Malformed(#[from] rlp::DecoderError),

    /// The peer record carries no UDP port to send to.
    #[error("Peer has no UDP endpoint")]
    MissingUdpEndpoint,

    /// A record claiming our own node id has nothing to teach us.
    #[error("Record carries our own node id")]
    OwnNodeId,

    #[error("Too many in-flight requests")]
    TooManyRequests,

    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// Umbrella error for the public API.
#[derive(Error, Debug)]
pub enum P2pError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Framing violation: {0}")]
    Framing(#[from] FramingError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Discovery: {0}")]
    Discovery(#[from] DiscoveryError),

    /// The remote ended the session with an explicit reason.
    #[error("Remote disconnected: {0}")]
    RemoteDisconnected(crate::rlpx::DisconnectReason),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// A discovery round trip expired; the unresponsive address gets banned.
    #[error("Request to {0} timed out")]
    RequestTimeout(SocketAddr),

    /// Connect rejected because every slot is taken. No side effects.
    #[error("No open connection slot")]
    NoOpenSlot,

    #[error("Already connected to {0}")]
    AlreadyConnected(NodeId),

    /// Add/connect rejected for a still-banned key. No side effects.
    #[error("Peer is banned")]
    Banned,

    #[error("Peer {0} is not known")]
    UnknownPeer(NodeId),

    /// The record offers no TCP endpoint to dial.
    #[error("Peer {0} advertises no listening address")]
    NotListening(NodeId),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Service is already running")]
    AlreadyRunning,
}

/// Result type alias for the public API.
pub type P2pResult<T> = Result<T, P2pError>;
