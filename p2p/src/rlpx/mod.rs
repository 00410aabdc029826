//! Encrypted peer-to-peer transport.
//!
//! The manager owns the connection pool and its slot budget, dials
//! candidates, accepts inbound connections and, when wired to discovery,
//! turns table changes into dial attempts. The handshake and frame cipher
//! live in [`ecies`], the per-connection tasks in [`peer`].

mod ecies;
mod mac;
mod peer;

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use metrics::counter;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, Mutex},
    time::timeout,
};

use kadmos_common::{
    crypto::{NodeId, NodeIdentity},
    tokio::spawn_task,
};

use crate::{
    config::{RlpxConfig, BAN_DURATION, EVENT_CHANNEL_CAPACITY},
    dpt::{Dpt, DptEvent, PeerRecord},
    error::{P2pError, P2pResult, ProtocolError},
};

use self::peer::{handshake, ClosedPeer, PendingSession};

pub use self::peer::{
    negotiate_capabilities, Capability, CapabilityHandle, CapabilityMessage, CapabilitySender,
    DisconnectReason, Hello, NegotiatedCapability, Peer,
};

/// Session lifecycle notifications. Established sessions hand over the
/// capability channels, so this stream has a single consumer.
pub enum RlpxEvent {
    /// A connection finished its handshake and entered the pool.
    SessionEstablished {
        peer: Arc<Peer>,
        capabilities: Vec<CapabilityHandle>,
    },
    /// An established session ended.
    SessionClosed {
        node_id: NodeId,
        /// Protocol reason when one was exchanged.
        reason: Option<DisconnectReason>,
    },
}

/// Transport manager: connection pool, slot budget and dial queue.
pub struct Rlpx {
    identity: Arc<NodeIdentity>,
    config: RlpxConfig,
    dpt: Option<Arc<Dpt>>,
    peers: Mutex<HashMap<NodeId, Arc<Peer>>>,
    // Connections past the socket but not yet in the pool.
    handshakes: AtomicUsize,
    // Dialable candidates waiting for a slot.
    queue: Mutex<VecDeque<PeerRecord>>,
    next_connection_id: AtomicU64,
    events: mpsc::Sender<RlpxEvent>,
    closed_tx: mpsc::Sender<ClosedPeer>,
    closed_rx: Mutex<Option<mpsc::Receiver<ClosedPeer>>>,
    exit_sender: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Rlpx {
    /// Build the manager. The returned receiver carries session events and
    /// their capability channels; call [`start`](Self::start) to begin.
    ///
    /// With a discovery handle the manager dials peers as the routing table
    /// learns them and bans the unreachable ones.
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: RlpxConfig,
        dpt: Option<Arc<Dpt>>,
    ) -> (Arc<Self>, mpsc::Receiver<RlpxEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (exit_sender, _) = broadcast::channel(1);

        let zelf = Arc::new(Self {
            identity,
            config,
            dpt,
            peers: Mutex::new(HashMap::new()),
            handshakes: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            next_connection_id: AtomicU64::new(0),
            events,
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            exit_sender,
            running: AtomicBool::new(false),
        });
        (zelf, events_rx)
    }

    /// Start the manager loops, listening for inbound connections on
    /// `bind_addr` when one is given. Returns the bound address.
    pub async fn start(
        self: &Arc<Self>,
        bind_addr: Option<SocketAddr>,
    ) -> P2pResult<Option<SocketAddr>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(P2pError::AlreadyRunning);
        }
        let Some(closed_rx) = self.closed_rx.lock().await.take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(P2pError::AlreadyRunning);
        };

        // Subscribe before spawning so a stop right after start is seen.
        let closed_exit = self.exit_sender.subscribe();
        let zelf = Arc::clone(self);
        spawn_task("rlpx-closed", async move {
            zelf.closed_loop(closed_rx, closed_exit).await;
        });

        let local_addr = match bind_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local_addr = listener.local_addr()?;
                info!(
                    "Listening for connections on {} as {}",
                    local_addr,
                    self.identity.node_id()
                );

                let accept_exit = self.exit_sender.subscribe();
                let zelf = Arc::clone(self);
                spawn_task("rlpx-accept", async move {
                    zelf.accept_loop(listener, accept_exit).await;
                });
                Some(local_addr)
            }
            None => None,
        };

        if let Some(dpt) = &self.dpt {
            let discovery_events = dpt.subscribe();
            let discovery_exit = self.exit_sender.subscribe();
            let zelf = Arc::clone(self);
            spawn_task("rlpx-discovery", async move {
                zelf.discovery_loop(discovery_events, discovery_exit).await;
            });
        }

        Ok(local_addr)
    }

    /// Stop the manager loops and say goodbye to every peer.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping transport");

        let peers: Vec<Arc<Peer>> = self.peers.lock().await.values().cloned().collect();
        for peer in peers {
            let _ = peer.disconnect(DisconnectReason::ClientQuitting).await;
        }
        let _ = self.exit_sender.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &NodeId {
        self.identity.node_id()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn get_peer(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.peers.lock().await.get(id).cloned()
    }

    /// Snapshot of the connection pool.
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().await.values().cloned().collect()
    }

    /// Slots left for new connections. Both pooled sessions and handshakes
    /// in flight occupy a slot.
    pub async fn open_slots(&self) -> usize {
        let established = self.peers.lock().await.len();
        self.config
            .max_peers
            .saturating_sub(established + self.handshakes.load(Ordering::SeqCst))
    }

    /// Dial a peer record and run the session to establishment.
    ///
    /// A record that cannot be reached is banned in discovery so the dial
    /// queue backs off from it.
    pub async fn connect(self: &Arc<Self>, record: PeerRecord) -> P2pResult<()> {
        let node_id = record.id.clone();
        if &node_id == self.identity.node_id() {
            return Err(ProtocolError::SameIdentity.into());
        }
        if self.peers.lock().await.contains_key(&node_id) {
            return Err(P2pError::AlreadyConnected(node_id));
        }
        if self.open_slots().await == 0 {
            return Err(P2pError::NoOpenSlot);
        }
        if let Some(dpt) = &self.dpt {
            if dpt.is_banned(&record).await {
                return Err(P2pError::Banned);
            }
        }
        let addr = record
            .tcp_addr()
            .ok_or_else(|| P2pError::NotListening(node_id.clone()))?;

        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let result = self.dial(addr, node_id).await;
        self.handshakes.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(session) => self.register(session).await,
            Err(e) => {
                counter!("kadmos_p2p_dial_failures").increment(1u64);
                if let Some(dpt) = &self.dpt {
                    dpt.ban_peer(&record, BAN_DURATION).await;
                }
                self.refill().await;
                Err(e)
            }
        }
    }

    /// End an established session with a protocol reason.
    pub async fn disconnect_peer(&self, id: &NodeId, reason: DisconnectReason) -> P2pResult<()> {
        let peer = self
            .peers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| P2pError::UnknownPeer(id.clone()))?;
        peer.disconnect(reason).await
    }

    async fn dial(&self, addr: SocketAddr, node_id: NodeId) -> P2pResult<PendingSession> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Dialing {} at {}", node_id, addr);
        }
        counter!("kadmos_p2p_outbound_connections").increment(1u64);

        let stream = timeout(self.config.timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::ConnectTimeout(addr))??;
        let own_hello = self.own_hello();
        timeout(
            self.config.timeout(),
            handshake(
                stream,
                Arc::clone(&self.identity),
                &self.config,
                &own_hello,
                Some(node_id),
            ),
        )
        .await
        .map_err(|_| P2pError::HandshakeTimeout)?
    }

    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream) -> P2pResult<()> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let own_hello = self.own_hello();
        let result = timeout(
            self.config.timeout(),
            handshake(
                stream,
                Arc::clone(&self.identity),
                &self.config,
                &own_hello,
                None,
            ),
        )
        .await;
        self.handshakes.fetch_sub(1, Ordering::SeqCst);

        let session = match result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(P2pError::HandshakeTimeout),
        };
        self.register(session).await
    }

    /// Put a handshaken session into the pool, or turn it away when a slot
    /// or identity conflict shows up. The final authority on both.
    async fn register(self: &Arc<Self>, session: PendingSession) -> P2pResult<()> {
        let node_id = session.node_id().clone();

        if !self.is_running() {
            session.reject(DisconnectReason::ClientQuitting).await;
            return Err(P2pError::ConnectionClosed);
        }
        let (peer, capabilities) = {
            let mut peers = self.peers.lock().await;
            if peers.contains_key(&node_id) {
                drop(peers);
                session.reject(DisconnectReason::AlreadyConnected).await;
                return Err(P2pError::AlreadyConnected(node_id));
            }
            let established = peers.len();
            let pending = self.handshakes.load(Ordering::SeqCst);
            if established + pending >= self.config.max_peers {
                drop(peers);
                counter!("kadmos_p2p_sessions_rejected").increment(1u64);
                session.reject(DisconnectReason::TooManyPeers).await;
                return Err(P2pError::NoOpenSlot);
            }

            let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
            let (peer, capabilities) =
                session.establish(id, &self.config, self.closed_tx.clone());
            peers.insert(node_id.clone(), Arc::clone(&peer));
            (peer, capabilities)
        };

        counter!("kadmos_p2p_sessions_established").increment(1u64);
        info!("Session established with {}", peer);

        let event = RlpxEvent::SessionEstablished {
            peer: Arc::clone(&peer),
            capabilities,
        };
        if self.events.send(event).await.is_err() {
            // Nobody consumes sessions anymore; do not keep them around.
            let _ = peer.disconnect(DisconnectReason::Requested).await;
        }
        Ok(())
    }

    fn own_hello(&self) -> Hello {
        Hello::new(
            self.config.client_id.clone(),
            self.config.capabilities.clone(),
            self.config.listen_port.unwrap_or(0),
            self.identity.node_id().clone(),
        )
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut exit: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = exit.recv() => break,
                result = listener.accept() => {
                    let (stream, from) = match result {
                        Ok(value) => value,
                        Err(e) => {
                            if self.is_running() {
                                warn!("Accept error: {}", e);
                            }
                            break;
                        }
                    };
                    counter!("kadmos_p2p_inbound_connections").increment(1u64);
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Inbound connection from {}", from);
                    }

                    let zelf = Arc::clone(&self);
                    spawn_task("rlpx-inbound", async move {
                        if let Err(e) = zelf.handle_inbound(stream).await {
                            debug!("Inbound session from {} failed: {}", from, e);
                        }
                    });
                }
            }
        }
        debug!("Accept loop ended");
    }

    async fn discovery_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<DptEvent>,
        mut exit: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = exit.recv() => break,
                event = events.recv() => match event {
                    Ok(DptEvent::PeerAdded(record)) => self.on_peer_discovered(record).await,
                    Ok(DptEvent::PeerRemoved(id)) => self.unqueue(&id).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Discovery events lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Discovery wiring loop ended");
    }

    async fn closed_loop(
        self: Arc<Self>,
        mut closed_rx: mpsc::Receiver<ClosedPeer>,
        mut exit: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = exit.recv() => break,
                closed = closed_rx.recv() => match closed {
                    Some(closed) => self.on_session_closed(closed).await,
                    None => break,
                },
            }
        }
        debug!("Session close loop ended");
    }

    async fn on_peer_discovered(self: &Arc<Self>, record: PeerRecord) {
        if record.tcp_addr().is_none() {
            return;
        }
        if self.open_slots().await > 0 {
            let zelf = Arc::clone(self);
            spawn_task("rlpx-dial", async move {
                if let Err(e) = zelf.connect(record).await {
                    debug!("Session with discovered peer failed: {}", e);
                }
            });
        } else {
            // Fresh discoveries go to the front, requeued old peers wait.
            let mut queue = self.queue.lock().await;
            if !queue.iter().any(|queued| queued.id == record.id) {
                queue.push_front(record);
            }
        }
    }

    async fn on_session_closed(self: &Arc<Self>, closed: ClosedPeer) {
        // Only deregister the connection that reported; a newer session for
        // the same identity may already hold the pool entry.
        let removed = {
            let mut peers = self.peers.lock().await;
            match peers.get(&closed.node_id) {
                Some(peer) if peer.id() == closed.id => peers.remove(&closed.node_id),
                _ => None,
            }
        };
        let Some(peer) = removed else {
            return;
        };

        peer.mark_closed();
        counter!("kadmos_p2p_sessions_closed").increment(1u64);
        match closed.reason {
            Some(reason) => info!("Session with {} closed ({})", peer, reason),
            None => info!("Session with {} closed", peer),
        }

        let event = RlpxEvent::SessionClosed {
            node_id: closed.node_id.clone(),
            reason: closed.reason,
        };
        let _ = self.events.send(event).await;

        if !self.is_running() {
            return;
        }
        // An identity the routing table still vouches for goes back on the
        // dial queue.
        if let Some(dpt) = &self.dpt {
            if let Some(record) = dpt.get_peer(&closed.node_id).await {
                if record.tcp_addr().is_some() {
                    let mut queue = self.queue.lock().await;
                    if !queue.iter().any(|queued| queued.id == record.id) {
                        queue.push_back(record);
                    }
                }
            }
        }
        self.refill().await;
    }

    async fn unqueue(&self, id: &NodeId) {
        self.queue.lock().await.retain(|queued| &queued.id != id);
    }

    /// Spend open slots on queued candidates. Register re-checks the slot
    /// count, so an overshoot here only costs a wasted handshake.
    ///
    /// Boxed future: `refill` and `connect` are mutually recursive through
    /// the spawned dial task, which plain `async fn`s cannot express.
    fn refill<'a>(self: &'a Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let slots = self.open_slots().await;
            if slots == 0 {
                return;
            }
            let records: Vec<PeerRecord> = {
                let mut queue = self.queue.lock().await;
                let take = slots.min(queue.len());
                queue.drain(..take).collect()
            };
            for record in records {
                let zelf = Arc::clone(self);
                spawn_task("rlpx-refill-dial", async move {
                    if let Err(e) = zelf.connect(record).await {
                        debug!("Refill dial failed: {}", e);
                    }
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dpt::Endpoint;

    fn test_config(max_peers: usize) -> RlpxConfig {
        RlpxConfig {
            max_peers,
            capabilities: vec![Capability::new("echo", 1, 4)],
            timeout_secs: 5,
            ..RlpxConfig::default()
        }
    }

    async fn start_node(
        max_peers: usize,
    ) -> (Arc<Rlpx>, mpsc::Receiver<RlpxEvent>, SocketAddr) {
        let identity = Arc::new(NodeIdentity::generate());
        let (rlpx, events) = Rlpx::new(identity, test_config(max_peers), None);
        let addr = rlpx
            .start(Some("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap()
            .expect("listener address");
        (rlpx, events, addr)
    }

    fn record_for(rlpx: &Rlpx, addr: SocketAddr) -> PeerRecord {
        PeerRecord::new(
            rlpx.node_id().clone(),
            Endpoint::new(addr.ip(), None, Some(addr.port())),
        )
    }

    async fn next_event(events: &mut mpsc::Receiver<RlpxEvent>) -> RlpxEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn test_connect_establishes_both_sides() {
        let (alice, mut alice_events, _) = start_node(10).await;
        let (bob, mut bob_events, bob_addr) = start_node(10).await;

        alice.connect(record_for(&bob, bob_addr)).await.unwrap();

        let (alice_peer, alice_caps) = match next_event(&mut alice_events).await {
            RlpxEvent::SessionEstablished { peer, capabilities } => (peer, capabilities),
            _ => panic!("expected an established session"),
        };
        let (bob_peer, mut bob_caps) = match next_event(&mut bob_events).await {
            RlpxEvent::SessionEstablished { peer, capabilities } => (peer, capabilities),
            _ => panic!("expected an established session"),
        };

        assert_eq!(alice_peer.node_id(), bob.node_id());
        assert_eq!(bob_peer.node_id(), alice.node_id());
        assert!(alice_peer.is_outbound());
        assert!(!bob_peer.is_outbound());
        assert_eq!(alice.peer_count().await, 1);
        assert_eq!(bob.peer_count().await, 1);
        assert_eq!(alice.open_slots().await, 9);

        // Messages flow through the negotiated capability channels.
        alice_caps[0].sender.send(0, b"hello bob").await.unwrap();
        let received = timeout(Duration::from_secs(5), bob_caps[0].receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.code, 0);
        assert_eq!(&received.payload[..], b"hello bob");

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (alice, mut alice_events, _) = start_node(10).await;
        let (bob, _bob_events, bob_addr) = start_node(10).await;

        alice.connect(record_for(&bob, bob_addr)).await.unwrap();
        let _ = next_event(&mut alice_events).await;

        let err = alice.connect(record_for(&bob, bob_addr)).await.unwrap_err();
        assert!(matches!(err, P2pError::AlreadyConnected(_)));

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_connect_to_self_fails() {
        let (alice, _events, addr) = start_node(10).await;
        let err = alice.connect(record_for(&alice, addr)).await.unwrap_err();
        assert!(matches!(
            err,
            P2pError::Protocol(ProtocolError::SameIdentity)
        ));
        alice.stop().await;
    }

    #[tokio::test]
    async fn test_connect_without_open_slot_fails() {
        let (alice, _alice_events, _) = start_node(0).await;
        let (bob, _bob_events, bob_addr) = start_node(10).await;

        let err = alice.connect(record_for(&bob, bob_addr)).await.unwrap_err();
        assert!(matches!(err, P2pError::NoOpenSlot));

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_connect_without_listen_address_fails() {
        let (alice, _events, _) = start_node(10).await;
        let stranger = NodeIdentity::generate();
        let record = PeerRecord::new(
            stranger.node_id().clone(),
            Endpoint::new("127.0.0.1".parse().unwrap(), Some(9), None),
        );

        let err = alice.connect(record).await.unwrap_err();
        assert!(matches!(err, P2pError::NotListening(_)));

        alice.stop().await;
    }

    #[tokio::test]
    async fn test_full_node_turns_peers_away() {
        // Bob accepts the handshake but has no slot to offer.
        let (alice, mut alice_events, _) = start_node(10).await;
        let (bob, _bob_events, bob_addr) = start_node(0).await;

        alice.connect(record_for(&bob, bob_addr)).await.unwrap();
        match next_event(&mut alice_events).await {
            RlpxEvent::SessionEstablished { peer, .. } => {
                assert_eq!(peer.node_id(), bob.node_id());
            }
            _ => panic!("expected an established session"),
        }

        // Bob turns the session away after the handshake with a reason.
        match next_event(&mut alice_events).await {
            RlpxEvent::SessionClosed { node_id, reason } => {
                assert_eq!(&node_id, bob.node_id());
                assert_eq!(reason, Some(DisconnectReason::TooManyPeers));
            }
            _ => panic!("expected the session to close"),
        }
        assert_eq!(alice.peer_count().await, 0);
        assert_eq!(bob.peer_count().await, 0);

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_stop_says_goodbye() {
        let (alice, mut alice_events, _) = start_node(10).await;
        let (bob, mut bob_events, bob_addr) = start_node(10).await;

        alice.connect(record_for(&bob, bob_addr)).await.unwrap();
        let _ = next_event(&mut alice_events).await;
        let _ = next_event(&mut bob_events).await;

        bob.stop().await;

        match next_event(&mut alice_events).await {
            RlpxEvent::SessionClosed { reason, .. } => {
                assert_eq!(reason, Some(DisconnectReason::ClientQuitting));
            }
            _ => panic!("expected the session to close"),
        }
        assert_eq!(alice.peer_count().await, 0);

        alice.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let identity = Arc::new(NodeIdentity::generate());
        let (rlpx, _events) = Rlpx::new(identity, test_config(10), None);

        rlpx.start(None).await.unwrap();
        let err = rlpx.start(None).await.unwrap_err();
        assert!(matches!(err, P2pError::AlreadyRunning));

        rlpx.stop().await;
    }
}
