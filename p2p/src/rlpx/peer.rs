//! Connection state machine for the encrypted transport.
//!
//! A connection moves through exact-size read phases: Auth (307 bytes) or
//! Ack (210 bytes) during the handshake, then an alternation of 32-byte
//! headers and padded bodies. After the HELLO exchange the stream splits
//! into a read task, a write task draining a per-connection channel, and a
//! liveness ping task.
//!
//! Base protocol (reserved codes 0..16): HELLO 0x00, DISCONNECT 0x01,
//! PING 0x02, PONG 0x03. Every message is `rlp(code) ‖ payload`; code zero
//! serializes as `0x80`. Negotiated capabilities get contiguous code ranges
//! starting at 16.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use log::{debug, warn};
use metrics::counter;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, mpsc, Mutex},
    time::{interval, sleep, timeout},
};

use kadmos_common::{
    crypto::{NodeId, NodeIdentity},
    tokio::spawn_task,
};

use crate::{
    config::{
        RlpxConfig, BASE_PROTOCOL_LENGTH, BASE_PROTOCOL_VERSION, CAPABILITY_CHANNEL_SIZE,
        DISCONNECT_GRACE, MAX_FRAME_BODY_SIZE, PEER_WRITE_CHANNEL_SIZE,
    },
    error::{FramingError, P2pError, P2pResult, ProtocolError},
    rlpx::ecies::{
        body_wire_size, EciesSession, FrameEgress, FrameIngress, ACK_PACKET_SIZE,
        AUTH_PACKET_SIZE, HEADER_SIZE,
    },
};

/// Reserved message codes of the base protocol.
pub mod base_code {
    pub const HELLO: u8 = 0x00;
    pub const DISCONNECT: u8 = 0x01;
    pub const PING: u8 = 0x02;
    pub const PONG: u8 = 0x03;
}

pub type Tx = mpsc::Sender<Bytes>;
pub type Rx = mpsc::Receiver<Bytes>;

/// A sub-protocol offered over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Short protocol name, e.g. "eth".
    pub name: String,
    /// Protocol version; only exact matches are negotiated.
    pub version: u32,
    /// Number of message codes the protocol uses. Local knowledge only;
    /// HELLO transmits just name and version.
    #[serde(default)]
    pub length: u8,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32, length: u8) -> Self {
        Self {
            name: name.into(),
            version,
            length,
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A shared capability with its assigned message-code range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCapability {
    pub capability: Capability,
    /// First absolute message code of the range.
    pub offset: u8,
}

impl NegotiatedCapability {
    /// Whether an absolute message code falls into this range.
    pub fn contains(&self, code: u8) -> bool {
        code >= self.offset
            && (code as u16) < self.offset as u16 + self.capability.length as u16
    }
}

/// Match the local capability set against a remote HELLO.
///
/// Only exact (name, version) pairs count; when several versions of one
/// protocol match, the highest wins. Matches are sorted by name and handed
/// contiguous code ranges starting right after the base protocol.
pub fn negotiate_capabilities(
    local: &[Capability],
    remote: &[Capability],
) -> Vec<NegotiatedCapability> {
    let mut shared: HashMap<&str, &Capability> = HashMap::new();
    for remote_cap in remote {
        for local_cap in local {
            if local_cap.name != remote_cap.name || local_cap.version != remote_cap.version {
                continue;
            }
            match shared.get(local_cap.name.as_str()) {
                Some(kept) if kept.version >= local_cap.version => {}
                _ => {
                    shared.insert(local_cap.name.as_str(), local_cap);
                }
            }
        }
    }

    let mut matched: Vec<&Capability> = shared.into_values().collect();
    matched.sort_by(|a, b| a.name.cmp(&b.name));

    let mut negotiated = Vec::with_capacity(matched.len());
    let mut offset = BASE_PROTOCOL_LENGTH as u16;
    for capability in matched {
        // Codes are one byte; a range past 255 cannot be addressed.
        if offset + capability.length as u16 > u8::MAX as u16 + 1 {
            break;
        }
        negotiated.push(NegotiatedCapability {
            capability: capability.clone(),
            offset: offset as u8,
        });
        offset += capability.length as u16;
    }
    negotiated
}

/// Reason codes carried by DISCONNECT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    Requested = 0x00,
    SubsystemError = 0x01,
    ProtocolBreach = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    IncompatibleProtocol = 0x06,
    NullIdentity = 0x07,
    ClientQuitting = 0x08,
    UnexpectedIdentity = 0x09,
    SameIdentity = 0x0a,
    Timeout = 0x0b,
    Subprotocol = 0x10,
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Requested),
            0x01 => Some(Self::SubsystemError),
            0x02 => Some(Self::ProtocolBreach),
            0x03 => Some(Self::UselessPeer),
            0x04 => Some(Self::TooManyPeers),
            0x05 => Some(Self::AlreadyConnected),
            0x06 => Some(Self::IncompatibleProtocol),
            0x07 => Some(Self::NullIdentity),
            0x08 => Some(Self::ClientQuitting),
            0x09 => Some(Self::UnexpectedIdentity),
            0x0a => Some(Self::SameIdentity),
            0x0b => Some(Self::Timeout),
            0x10 => Some(Self::Subprotocol),
            _ => None,
        }
    }
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Requested => "disconnect requested",
            Self::SubsystemError => "subsystem error",
            Self::ProtocolBreach => "breach of protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleProtocol => "incompatible protocol version",
            Self::NullIdentity => "null node identity",
            Self::ClientQuitting => "client quitting",
            Self::UnexpectedIdentity => "unexpected identity",
            Self::SameIdentity => "connected to self",
            Self::Timeout => "ping timeout",
            Self::Subprotocol => "subprotocol reason",
        };
        f.write_str(text)
    }
}

/// HELLO payload: `[protocol_version, client_id, [[name, version]...],
/// listen_port, node_id]`. A listen port of zero means "not listening".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

impl Hello {
    pub fn new(
        client_id: String,
        capabilities: Vec<Capability>,
        listen_port: u16,
        node_id: NodeId,
    ) -> Self {
        Self {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id,
            capabilities,
            listen_port,
            node_id,
        }
    }
}

impl Encodable for Hello {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.protocol_version);
        s.append(&self.client_id);
        s.begin_list(self.capabilities.len());
        for capability in &self.capabilities {
            s.begin_list(2);
            s.append(&capability.name);
            s.append(&capability.version);
        }
        s.append(&self.listen_port);
        s.append(&self.node_id.as_bytes().to_vec());
    }
}

impl Decodable for Hello {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? < 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let protocol_version = rlp.val_at(0)?;
        let client_id = rlp.val_at(1)?;

        let caps = rlp.at(2)?;
        if !caps.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        let mut capabilities = Vec::with_capacity(caps.item_count()?);
        for item in caps.iter() {
            if item.item_count()? < 2 {
                return Err(DecoderError::RlpIncorrectListLen);
            }
            capabilities.push(Capability {
                name: item.val_at(0)?,
                version: item.val_at(1)?,
                length: 0,
            });
        }

        let listen_port = rlp.val_at(3)?;
        let node_id = NodeId::try_from(rlp.at(4)?.data()?)
            .map_err(|_| DecoderError::Custom("invalid node id length"))?;
        Ok(Self {
            protocol_version,
            client_id,
            capabilities,
            listen_port,
            node_id,
        })
    }
}

/// Inbound sub-protocol message with its capability-relative code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityMessage {
    pub code: u8,
    pub payload: Bytes,
}

/// Outbound side of one negotiated capability. Relative codes are range
/// checked and shifted into the capability's absolute range.
#[derive(Debug, Clone)]
pub struct CapabilitySender {
    capability: Capability,
    offset: u8,
    tx: Tx,
}

impl CapabilitySender {
    pub async fn send(&self, code: u8, payload: &[u8]) -> P2pResult<()> {
        if code >= self.capability.length {
            return Err(ProtocolError::CodeOutOfRange(code).into());
        }
        let message = encode_message(self.offset + code, payload);
        // The write task cannot report errors back; a message the framing
        // layer would refuse must fail here, where the caller sees it.
        if message.len() > MAX_FRAME_BODY_SIZE {
            return Err(FramingError::InvalidBodySize(message.len(), MAX_FRAME_BODY_SIZE).into());
        }
        self.tx.send(message).await.map_err(|_| P2pError::ChannelClosed)
    }
}

/// What a sub-protocol collaborator receives for each negotiated
/// capability when a session is established.
pub struct CapabilityHandle {
    pub capability: Capability,
    pub sender: CapabilitySender,
    pub receiver: mpsc::Receiver<CapabilityMessage>,
}

/// Notification that a connection's tasks have stopped.
#[derive(Debug)]
pub(crate) struct ClosedPeer {
    pub id: u64,
    pub node_id: NodeId,
    /// Protocol reason when one was exchanged; `None` for plain socket
    /// closes and transport errors.
    pub reason: Option<DisconnectReason>,
}

/// An established connection as seen by the manager and collaborators.
pub struct Peer {
    id: u64,
    node_id: NodeId,
    addr: SocketAddr,
    outbound: bool,
    hello: Hello,
    capabilities: Vec<NegotiatedCapability>,
    // Channel to the writer task.
    tx: Tx,
    // Listened to by all three connection tasks.
    exit_channel: broadcast::Sender<()>,
    closed: AtomicBool,
    // Reason we initiated a disconnect with, reported on close.
    close_reason: Mutex<Option<DisconnectReason>>,
}

impl Peer {
    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Authenticated identity of the remote node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Observed socket address of the connection.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether we dialed this connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Client identifier the remote announced in its HELLO.
    pub fn client_id(&self) -> &str {
        &self.hello.client_id
    }

    /// Capabilities negotiated for this session.
    pub fn capabilities(&self) -> &[NegotiatedCapability] {
        &self.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// End the session with a reason. The DISCONNECT is flushed through
    /// the writer, then the tasks are stopped after the grace period.
    pub async fn disconnect(&self, reason: DisconnectReason) -> P2pResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.close_reason.lock().await = Some(reason);
        if log::log_enabled!(log::Level::Debug) {
            debug!("Disconnecting {} ({})", self, reason);
        }
        counter!("kadmos_p2p_disconnects_sent").increment(1u64);

        let result = self.send_bytes(disconnect_message(reason)).await;
        let exit = self.exit_channel.clone();
        spawn_task("rlpx-peer-close", async move {
            sleep(DISCONNECT_GRACE).await;
            let _ = exit.send(());
        });
        result
    }

    pub(crate) async fn send_bytes(&self, bytes: Bytes) -> P2pResult<()> {
        self.tx.send(bytes).await.map_err(|_| P2pError::ChannelClosed)
    }

    pub(crate) fn signal_exit(&self) -> P2pResult<()> {
        self.exit_channel
            .send(())
            .map(|_| ())
            .map_err(|_| P2pError::ChannelClosed)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let direction = if self.outbound { "out" } else { "in" };
        write!(f, "Peer[{} {}, id {}]", direction, self.addr, self.node_id)
    }
}

/// Prefix a payload with its RLP-encoded message code.
fn encode_message(code: u8, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(2 + payload.len());
    match code {
        0 => out.push(0x80),
        code if code < 0x80 => out.push(code),
        code => {
            out.push(0x81);
            out.push(code);
        }
    }
    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// Split a frame body into its message code and the payload offset.
fn split_message(body: &[u8]) -> Result<(u8, usize), ProtocolError> {
    let first = *body.first().ok_or(ProtocolError::EmptyBody)?;
    match first {
        0x80 => Ok((0, 1)),
        code if code < 0x80 => Ok((code, 1)),
        0x81 => {
            let code = *body.get(1).ok_or(ProtocolError::EmptyBody)?;
            if code < 0x80 {
                // Non-minimal encoding of a code that fits one byte.
                return Err(ProtocolError::CodeOutOfRange(code));
            }
            Ok((code, 2))
        }
        code => Err(ProtocolError::CodeOutOfRange(code)),
    }
}

fn ping_message() -> Bytes {
    encode_message(base_code::PING, &rlp::EMPTY_LIST_RLP)
}

fn pong_message() -> Bytes {
    encode_message(base_code::PONG, &rlp::EMPTY_LIST_RLP)
}

/// DISCONNECT payload is the canonical single-item list `[reason]`.
fn disconnect_message(reason: DisconnectReason) -> Bytes {
    let mut s = RlpStream::new_list(1);
    s.append(&reason.code());
    encode_message(base_code::DISCONNECT, &s.out())
}

/// Accepts both the canonical `[reason]` list and the bare integer some
/// implementations send.
fn decode_disconnect(payload: &[u8]) -> Result<DisconnectReason, ProtocolError> {
    let rlp = Rlp::new(payload);
    let code: u8 = if rlp.is_list() {
        if rlp.item_count()? == 0 {
            return Err(DecoderError::RlpIncorrectListLen.into());
        }
        rlp.val_at(0)?
    } else {
        rlp.as_val()?
    };
    DisconnectReason::from_code(code).ok_or(ProtocolError::Malformed(DecoderError::Custom(
        "unknown disconnect reason",
    )))
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    ingress: &mut FrameIngress,
) -> P2pResult<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let size = ingress.parse_header(&header)?;

    let mut body = vec![0u8; body_wire_size(size)];
    reader.read_exact(&mut body).await?;
    ingress.parse_body(&body)
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    egress: &mut FrameEgress,
    body: &[u8],
) -> P2pResult<()> {
    let header = egress.create_header(body.len())?;
    writer.write_all(&header).await?;
    let frame = egress.create_body(body)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// A connection that finished its handshake and HELLO exchange but has no
/// tasks yet. The manager decides whether it becomes a peer.
pub(crate) struct PendingSession {
    stream: TcpStream,
    addr: SocketAddr,
    node_id: NodeId,
    hello: Hello,
    negotiated: Vec<NegotiatedCapability>,
    ingress: FrameIngress,
    egress: FrameEgress,
    outbound: bool,
}

/// Run the crypto handshake and HELLO exchange on a fresh stream.
///
/// `remote_id` is the dialed identity for outbound connections and `None`
/// for inbound ones, where the Auth packet reveals it. Identity checks and
/// capability negotiation happen here; a failed negotiation already sends
/// the matching DISCONNECT.
pub(crate) async fn handshake(
    mut stream: TcpStream,
    identity: Arc<NodeIdentity>,
    config: &RlpxConfig,
    own_hello: &Hello,
    remote_id: Option<NodeId>,
) -> P2pResult<PendingSession> {
    let addr = stream.peer_addr()?;
    let own_id = identity.node_id().clone();
    let outbound = remote_id.is_some();

    let mut session = match remote_id {
        Some(id) => EciesSession::initiator(identity, id),
        None => EciesSession::responder(identity),
    };

    if outbound {
        let auth = session.create_auth()?;
        stream.write_all(&auth).await?;
        let mut ack = [0u8; ACK_PACKET_SIZE];
        stream.read_exact(&mut ack).await?;
        session.parse_ack(&ack)?;
    } else {
        let mut auth = [0u8; AUTH_PACKET_SIZE];
        stream.read_exact(&mut auth).await?;
        session.parse_auth(&auth)?;
        let ack = session.create_ack()?;
        stream.write_all(&ack).await?;
    }
    let (node_id, mut ingress, mut egress) = session.split()?;

    // Both sides push their HELLO as soon as the frame secrets exist.
    let hello_message = encode_message(base_code::HELLO, &rlp::encode(own_hello));
    write_frame(&mut stream, &mut egress, &hello_message).await?;

    let body = read_frame(&mut stream, &mut ingress).await?;
    let (code, offset) = split_message(&body)?;
    let payload = &body[offset..];
    let hello = match code {
        base_code::HELLO => Hello::decode(&Rlp::new(payload)).map_err(ProtocolError::from)?,
        base_code::DISCONNECT => {
            let reason = decode_disconnect(payload)?;
            return Err(P2pError::RemoteDisconnected(reason));
        }
        other => return Err(ProtocolError::UnexpectedMessage(other).into()),
    };

    if node_id == own_id {
        let goodbye = disconnect_message(DisconnectReason::SameIdentity);
        let _ = write_frame(&mut stream, &mut egress, &goodbye).await;
        return Err(ProtocolError::SameIdentity.into());
    }
    // The ECIES handshake already authenticated the identity; a HELLO
    // claiming a different one is lying about something.
    if hello.node_id != node_id {
        let goodbye = disconnect_message(DisconnectReason::UnexpectedIdentity);
        let _ = write_frame(&mut stream, &mut egress, &goodbye).await;
        return Err(ProtocolError::UnexpectedIdentity.into());
    }

    let negotiated = negotiate_capabilities(&config.capabilities, &hello.capabilities);
    if negotiated.is_empty() {
        let goodbye = disconnect_message(DisconnectReason::IncompatibleProtocol);
        let _ = write_frame(&mut stream, &mut egress, &goodbye).await;
        return Err(ProtocolError::NoSharedCapability.into());
    }

    if log::log_enabled!(log::Level::Debug) {
        debug!(
            "Handshake with {} at {} complete ({} shared capabilities)",
            node_id,
            addr,
            negotiated.len()
        );
    }

    Ok(PendingSession {
        stream,
        addr,
        node_id,
        hello,
        negotiated,
        ingress,
        egress,
        outbound,
    })
}

impl PendingSession {
    pub(crate) fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Turn away a completed handshake (capacity, duplicate identity).
    pub(crate) async fn reject(mut self, reason: DisconnectReason) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Rejecting {} at {}: {}", self.node_id, self.addr, reason);
        }
        counter!("kadmos_p2p_disconnects_sent").increment(1u64);
        let goodbye = disconnect_message(reason);
        if write_frame(&mut self.stream, &mut self.egress, &goodbye)
            .await
            .is_ok()
        {
            // Leave the socket open long enough for the frame to flush.
            sleep(DISCONNECT_GRACE).await;
        }
    }

    /// Promote the session into a running peer: split the stream, wire the
    /// capability channels and spawn the read, write and ping tasks.
    pub(crate) fn establish(
        self,
        id: u64,
        config: &RlpxConfig,
        closed_tx: mpsc::Sender<ClosedPeer>,
    ) -> (Arc<Peer>, Vec<CapabilityHandle>) {
        let PendingSession {
            stream,
            addr,
            node_id,
            hello,
            negotiated,
            ingress,
            egress,
            outbound,
        } = self;

        let (tx, rx) = mpsc::channel(PEER_WRITE_CHANNEL_SIZE);
        let (exit_channel, _) = broadcast::channel(1);

        let peer = Arc::new(Peer {
            id,
            node_id: node_id.clone(),
            addr,
            outbound,
            hello,
            capabilities: negotiated.clone(),
            tx,
            exit_channel: exit_channel.clone(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });

        let mut handles = Vec::with_capacity(negotiated.len());
        let mut dispatchers = Vec::with_capacity(negotiated.len());
        for cap in negotiated {
            let (cap_tx, cap_rx) = mpsc::channel(CAPABILITY_CHANNEL_SIZE);
            handles.push(CapabilityHandle {
                capability: cap.capability.clone(),
                sender: CapabilitySender {
                    capability: cap.capability.clone(),
                    offset: cap.offset,
                    tx: peer.tx.clone(),
                },
                receiver: cap_rx,
            });
            dispatchers.push((cap, cap_tx));
        }

        let (read_half, write_half) = stream.into_split();
        let (pong_tx, pong_rx) = mpsc::channel(1);

        // Receivers subscribed before the tasks spawn so no exit is missed.
        let write_exit = exit_channel.subscribe();
        let ping_exit = exit_channel.subscribe();
        let read_exit = exit_channel.subscribe();

        spawn_task(
            "rlpx-peer-write",
            write_loop(Arc::clone(&peer), write_half, egress, rx, write_exit),
        );
        spawn_task(
            "rlpx-peer-ping",
            ping_loop(
                Arc::clone(&peer),
                pong_rx,
                ping_exit,
                config.ping_interval(),
                config.timeout(),
            ),
        );

        let reader = Arc::clone(&peer);
        spawn_task("rlpx-peer-read", async move {
            let remote_reason =
                read_loop(&reader, read_half, ingress, &dispatchers, &pong_tx, read_exit).await;
            reader.mark_closed();
            let reason = match remote_reason {
                Some(reason) => Some(reason),
                None => *reader.close_reason.lock().await,
            };
            let _ = reader.signal_exit();
            let _ = closed_tx.send(ClosedPeer { id, node_id, reason }).await;
        });

        (peer, handles)
    }
}

async fn write_loop(
    peer: Arc<Peer>,
    mut write_half: OwnedWriteHalf,
    mut egress: FrameEgress,
    mut rx: Rx,
    mut exit: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = exit.recv() => break,
            message = rx.recv() => match message {
                Some(bytes) => {
                    if let Err(e) = write_frame(&mut write_half, &mut egress, &bytes).await {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Write to {} failed: {}", peer, e);
                        }
                        break;
                    }
                    counter!("kadmos_p2p_messages_sent").increment(1u64);
                }
                None => break,
            },
        }
    }
    // Wake the other tasks; dropping the write half sends the FIN.
    let _ = peer.signal_exit();
}

async fn ping_loop(
    peer: Arc<Peer>,
    mut pong_rx: mpsc::Receiver<()>,
    mut exit: broadcast::Receiver<()>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ticker = interval(ping_interval);
    loop {
        tokio::select! {
            biased;
            _ = exit.recv() => break,
            _ = ticker.tick() => {}
        }
        if peer.send_bytes(ping_message()).await.is_err() {
            break;
        }
        counter!("kadmos_p2p_pings_sent").increment(1u64);

        match timeout(pong_timeout, pong_rx.recv()).await {
            Ok(Some(())) => {}
            // The read task dropped its sender; nothing left to watch.
            Ok(None) => break,
            Err(_) => {
                warn!("{} did not answer a liveness ping within {:?}", peer, pong_timeout);
                counter!("kadmos_p2p_ping_timeouts").increment(1u64);
                let _ = peer.disconnect(DisconnectReason::Timeout).await;
                break;
            }
        }
    }
}

async fn read_loop(
    peer: &Peer,
    mut read_half: OwnedReadHalf,
    mut ingress: FrameIngress,
    dispatchers: &[(NegotiatedCapability, mpsc::Sender<CapabilityMessage>)],
    pong_tx: &mpsc::Sender<()>,
    mut exit: broadcast::Receiver<()>,
) -> Option<DisconnectReason> {
    loop {
        let body = tokio::select! {
            biased;
            _ = exit.recv() => return None,
            result = read_frame(&mut read_half, &mut ingress) => match result {
                Ok(body) => body,
                Err(e) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Read from {} failed: {}", peer, e);
                    }
                    return None;
                }
            },
        };
        counter!("kadmos_p2p_messages_received").increment(1u64);

        let body = Bytes::from(body);
        let (code, offset) = match split_message(&body) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("Unparseable message from {}: {}", peer, e);
                counter!("kadmos_p2p_messages_dropped").increment(1u64);
                continue;
            }
        };
        let payload = body.slice(offset..);

        if code >= BASE_PROTOCOL_LENGTH {
            dispatch_capability(peer, dispatchers, code, payload).await;
            continue;
        }
        match code {
            base_code::DISCONNECT => {
                return match decode_disconnect(&payload) {
                    Ok(reason) => {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("{} disconnected: {}", peer, reason);
                        }
                        Some(reason)
                    }
                    Err(e) => {
                        debug!("Bad DISCONNECT from {}: {}", peer, e);
                        None
                    }
                };
            }
            base_code::PING => {
                if peer.send_bytes(pong_message()).await.is_err() {
                    return None;
                }
            }
            base_code::PONG => {
                let _ = pong_tx.try_send(());
            }
            // HELLO after establishment and the unused base codes carry
            // nothing actionable.
            _ => {}
        }
    }
}

async fn dispatch_capability(
    peer: &Peer,
    dispatchers: &[(NegotiatedCapability, mpsc::Sender<CapabilityMessage>)],
    code: u8,
    payload: Bytes,
) {
    if let Some((cap, sender)) = dispatchers.iter().find(|(cap, _)| cap.contains(code)) {
        let message = CapabilityMessage {
            code: code - cap.offset,
            payload,
        };
        if sender.send(message).await.is_err() && log::log_enabled!(log::Level::Trace) {
            log::trace!("{}: {} receiver dropped", peer, cap.capability);
        }
        return;
    }
    counter!("kadmos_p2p_messages_dropped").increment(1u64);
    if log::log_enabled!(log::Level::Debug) {
        debug!("{}: dropping message with unmapped code {}", peer, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn cap(name: &str, version: u32, length: u8) -> Capability {
        Capability::new(name, version, length)
    }

    #[test]
    fn test_negotiation_picks_highest_shared_version() {
        let local = vec![cap("foo", 1, 8), cap("foo", 2, 8)];
        let remote = vec![cap("foo", 2, 0), cap("foo", 1, 0)];

        let negotiated = negotiate_capabilities(&local, &remote);
        assert_eq!(negotiated.len(), 1);
        assert_eq!(negotiated[0].capability.name, "foo");
        assert_eq!(negotiated[0].capability.version, 2);
        assert_eq!(negotiated[0].offset, BASE_PROTOCOL_LENGTH);
    }

    #[test]
    fn test_negotiation_requires_exact_match() {
        let local = vec![cap("bar", 1, 4)];
        let remote = vec![cap("foo", 1, 0)];
        assert!(negotiate_capabilities(&local, &remote).is_empty());

        let remote = vec![cap("bar", 2, 0)];
        assert!(negotiate_capabilities(&local, &remote).is_empty());
    }

    #[test]
    fn test_negotiation_assigns_contiguous_offsets_by_name() {
        let local = vec![cap("zz", 1, 4), cap("aa", 1, 10)];
        let remote = vec![cap("zz", 1, 0), cap("aa", 1, 0)];

        let negotiated = negotiate_capabilities(&local, &remote);
        assert_eq!(negotiated.len(), 2);
        assert_eq!(negotiated[0].capability.name, "aa");
        assert_eq!(negotiated[0].offset, 16);
        assert_eq!(negotiated[1].capability.name, "zz");
        assert_eq!(negotiated[1].offset, 26);

        assert!(negotiated[0].contains(16));
        assert!(negotiated[0].contains(25));
        assert!(!negotiated[0].contains(26));
        assert!(negotiated[1].contains(26));
        assert!(!negotiated[1].contains(30));
    }

    #[test]
    fn test_hello_round_trip() {
        let identity = NodeIdentity::generate();
        let hello = Hello::new(
            "kadmos/test".to_string(),
            vec![cap("foo", 1, 8), cap("bar", 3, 2)],
            7512,
            identity.node_id().clone(),
        );

        let encoded = rlp::encode(&hello);
        let decoded = Hello::decode(&Rlp::new(&encoded)).unwrap();

        assert_eq!(decoded.protocol_version, BASE_PROTOCOL_VERSION);
        assert_eq!(decoded.client_id, "kadmos/test");
        assert_eq!(decoded.listen_port, 7512);
        assert_eq!(&decoded.node_id, identity.node_id());
        assert_eq!(decoded.capabilities.len(), 2);
        assert_eq!(decoded.capabilities[0].name, "foo");
        assert_eq!(decoded.capabilities[0].version, 1);
        assert_eq!(decoded.capabilities[1].name, "bar");
        assert_eq!(decoded.capabilities[1].version, 3);
    }

    #[test]
    fn test_hello_zero_port_round_trip() {
        let identity = NodeIdentity::generate();
        let hello = Hello::new("x".to_string(), vec![], 0, identity.node_id().clone());

        let encoded = rlp::encode(&hello);
        let decoded = Hello::decode(&Rlp::new(&encoded)).unwrap();
        assert_eq!(decoded.listen_port, 0);
        assert!(decoded.capabilities.is_empty());
    }

    #[test]
    fn test_message_code_encoding() {
        // Code zero serializes as the RLP empty string.
        let message = encode_message(0, b"x");
        assert_eq!(message[0], 0x80);
        assert_eq!(split_message(&message).unwrap(), (0, 1));

        for code in [1u8, base_code::PONG, 0x10, 0x7f] {
            let message = encode_message(code, b"payload");
            assert_eq!(message[0], code);
            assert_eq!(split_message(&message).unwrap(), (code, 1));
        }

        // Codes past 0x7f need a two-byte RLP integer.
        let message = encode_message(0x84, b"p");
        assert_eq!(&message[..2], &[0x81, 0x84]);
        assert_eq!(split_message(&message).unwrap(), (0x84, 2));

        assert!(matches!(
            split_message(&[]),
            Err(ProtocolError::EmptyBody)
        ));
        assert!(matches!(
            split_message(&[0x82, 0x01, 0x02]),
            Err(ProtocolError::CodeOutOfRange(0x82))
        ));
    }

    #[test]
    fn test_disconnect_decode_accepts_list_and_bare_int() {
        let message = disconnect_message(DisconnectReason::TooManyPeers);
        let (code, offset) = split_message(&message).unwrap();
        assert_eq!(code, base_code::DISCONNECT);
        assert_eq!(
            decode_disconnect(&message[offset..]).unwrap(),
            DisconnectReason::TooManyPeers
        );

        // Bare integer form.
        let mut s = RlpStream::new();
        s.append(&DisconnectReason::Timeout.code());
        assert_eq!(
            decode_disconnect(&s.out()).unwrap(),
            DisconnectReason::Timeout
        );

        // Requested is code zero, the empty-string edge.
        let message = disconnect_message(DisconnectReason::Requested);
        let (_, offset) = split_message(&message).unwrap();
        assert_eq!(
            decode_disconnect(&message[offset..]).unwrap(),
            DisconnectReason::Requested
        );

        assert!(decode_disconnect(&[0xc0]).is_err());
    }

    #[tokio::test]
    async fn test_capability_sender_checks_range() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = CapabilitySender {
            capability: cap("echo", 1, 2),
            offset: 16,
            tx,
        };

        assert!(matches!(
            sender.send(2, b"nope").await,
            Err(P2pError::Protocol(ProtocolError::CodeOutOfRange(2)))
        ));

        sender.send(1, b"data").await.unwrap();
        let bytes = rx.recv().await.unwrap();
        assert_eq!(bytes[0], 17);
        assert_eq!(&bytes[1..], b"data");
    }

    #[tokio::test]
    async fn test_capability_sender_rejects_oversized_payload() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = CapabilitySender {
            capability: cap("bulk", 1, 2),
            offset: 16,
            tx,
        };

        // The code byte pushes the encoded message one past the frame cap.
        let payload = vec![0u8; MAX_FRAME_BODY_SIZE];
        assert!(matches!(
            sender.send(0, &payload).await,
            Err(P2pError::Framing(FramingError::InvalidBodySize(..)))
        ));
        // Nothing reached the write channel, so the session stays up.
        assert!(rx.try_recv().is_err());

        sender.send(0, b"small").await.unwrap();
        assert_eq!(rx.recv().await.unwrap()[0], 16);
    }

    fn test_config(capabilities: Vec<Capability>) -> RlpxConfig {
        RlpxConfig {
            capabilities,
            timeout_secs: 5,
            ..RlpxConfig::default()
        }
    }

    fn hello_for(identity: &NodeIdentity, config: &RlpxConfig) -> Hello {
        Hello::new(
            config.client_id.clone(),
            config.capabilities.clone(),
            config.listen_port.unwrap_or(0),
            identity.node_id().clone(),
        )
    }

    async fn handshake_pair(
        alice_caps: Vec<Capability>,
        bob_caps: Vec<Capability>,
    ) -> (
        P2pResult<PendingSession>,
        P2pResult<PendingSession>,
        RlpxConfig,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let alice = Arc::new(NodeIdentity::generate());
        let bob = Arc::new(NodeIdentity::generate());
        let alice_config = test_config(alice_caps);
        let bob_config = test_config(bob_caps);

        let bob_task = {
            let bob = Arc::clone(&bob);
            let config = bob_config.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let hello = hello_for(&bob, &config);
                handshake(stream, bob, &config, &hello, None).await
            })
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let hello = hello_for(&alice, &alice_config);
        let outbound = handshake(
            stream,
            Arc::clone(&alice),
            &alice_config,
            &hello,
            Some(bob.node_id().clone()),
        )
        .await;
        let inbound = bob_task.await.unwrap();
        (outbound, inbound, alice_config)
    }

    #[tokio::test]
    async fn test_handshake_and_capability_exchange() {
        let shared = cap("echo", 1, 4);
        let (outbound, inbound, config) =
            handshake_pair(vec![shared.clone()], vec![shared.clone()]).await;
        let outbound = outbound.unwrap();
        let inbound = inbound.unwrap();
        assert_eq!(outbound.negotiated.len(), 1);
        assert_eq!(inbound.negotiated, outbound.negotiated);

        let (closed_tx_a, _closed_rx_a) = mpsc::channel(4);
        let (closed_tx_b, mut closed_rx_b) = mpsc::channel(4);
        let (peer_a, handles_a) = outbound.establish(1, &config, closed_tx_a);
        let (peer_b, mut handles_b) = inbound.establish(2, &config, closed_tx_b);

        assert!(peer_a.is_outbound());
        assert!(!peer_b.is_outbound());
        assert_eq!(peer_a.capabilities()[0].capability, shared);

        handles_a[0].sender.send(3, b"over the top").await.unwrap();
        let received = handles_b[0].receiver.recv().await.unwrap();
        assert_eq!(received.code, 3);
        assert_eq!(&received.payload[..], b"over the top");

        // A graceful disconnect surfaces the reason on the other side.
        peer_a.disconnect(DisconnectReason::Requested).await.unwrap();
        let closed = closed_rx_b.recv().await.unwrap();
        assert_eq!(closed.id, peer_b.id());
        assert_eq!(closed.reason, Some(DisconnectReason::Requested));
    }

    #[tokio::test]
    async fn test_handshake_without_shared_capability_fails() {
        let (outbound, inbound, _) =
            handshake_pair(vec![cap("foo", 1, 4)], vec![cap("bar", 1, 4)]).await;

        // One side detects the empty intersection itself; the other may
        // see it first through the peer's DISCONNECT.
        for result in [outbound, inbound] {
            match result {
                Err(P2pError::Protocol(ProtocolError::NoSharedCapability)) => {}
                Err(P2pError::RemoteDisconnected(DisconnectReason::IncompatibleProtocol)) => {}
                other => panic!("expected capability failure, got {:?}", other.err()),
            }
        }
    }

    #[tokio::test]
    async fn test_connecting_to_self_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let identity = Arc::new(NodeIdentity::generate());
        let config = test_config(vec![cap("echo", 1, 4)]);

        let server = {
            let identity = Arc::clone(&identity);
            let config = config.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let hello = hello_for(&identity, &config);
                handshake(stream, identity, &config, &hello, None).await
            })
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let hello = hello_for(&identity, &config);
        let outbound = handshake(
            stream,
            Arc::clone(&identity),
            &config,
            &hello,
            Some(identity.node_id().clone()),
        )
        .await;

        assert!(matches!(
            outbound,
            Err(P2pError::Protocol(ProtocolError::SameIdentity))
        ));
        let inbound = server.await.unwrap();
        assert!(inbound.is_err());
    }

    #[tokio::test]
    async fn test_silent_peer_disconnects_with_timeout() {
        let shared = cap("echo", 1, 4);
        let (outbound, inbound, config) =
            handshake_pair(vec![shared.clone()], vec![shared]).await;
        let outbound = outbound.unwrap();
        let mut inbound = inbound.unwrap();

        let short = RlpxConfig {
            timeout_secs: 1,
            ping_interval_secs: 1,
            ..config
        };
        let (closed_tx, mut closed_rx) = mpsc::channel(4);
        let (_peer, _handles) = outbound.establish(7, &short, closed_tx);

        // Scripted remote: reads frames but never answers, then hangs up
        // once the DISCONNECT arrives.
        tokio::spawn(async move {
            loop {
                match read_frame(&mut inbound.stream, &mut inbound.ingress).await {
                    Ok(body) => {
                        if let Ok((base_code::DISCONNECT, _)) = split_message(&body) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let closed = timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .expect("close notification")
            .expect("channel open");
        assert_eq!(closed.reason, Some(DisconnectReason::Timeout));
    }
}
