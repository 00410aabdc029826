//! Kademlia-style node discovery over UDP.
//!
//! The manager owns the routing table and the ban list, answers inbound
//! requests, and runs the bootstrap/refresh lifecycle. Wire concerns live
//! in [`server`], the table in [`routing_table`].

pub mod messages;
mod ban_list;
mod routing_table;
mod server;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info, trace, warn};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use tokio::{
    sync::{broadcast, Mutex},
    time::{interval, sleep},
};

use kadmos_common::{
    crypto::{Hash, NodeId, NodeIdentity, NODE_ID_SIZE},
    tokio::spawn_task,
};

use crate::{
    config::{
        DptConfig, BAN_LIST_CAPACITY, BUCKET_SIZE, EVENT_CHANNEL_CAPACITY, MAX_DATAGRAM_SIZE,
        NEIGHBOURS_MAX_PER_PACKET, PENDING_ADD_DELAY,
    },
    error::{DiscoveryError, P2pError, P2pResult},
};

use self::{
    ban_list::BanList,
    messages::{FindNeighbours, Message, Neighbours, Ping, Pong, ReceivedMessage},
    routing_table::{InsertResult, RoutingTable},
    server::DptServer,
};

pub use self::messages::{Endpoint, PeerRecord};

/// Changes in the set of known peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DptEvent {
    /// A new peer answered a ping and entered the routing table.
    PeerAdded(PeerRecord),
    /// A peer was removed from the routing table.
    PeerRemoved(NodeId),
}

/// Discovery manager: routing table, ban list and protocol lifecycle.
pub struct Dpt {
    identity: Arc<NodeIdentity>,
    config: DptConfig,
    server: DptServer,
    table: RoutingTable,
    ban_list: Mutex<BanList>,
    events: broadcast::Sender<DptEvent>,
    exit_sender: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Dpt {
    /// Bind the discovery socket and build the manager. Call
    /// [`start`](Self::start) to begin processing packets.
    pub async fn new(
        identity: Arc<NodeIdentity>,
        bind_addr: SocketAddr,
        config: DptConfig,
    ) -> P2pResult<Arc<Self>> {
        let server = DptServer::bind(identity.clone(), bind_addr, &config).await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (exit_sender, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            table: RoutingTable::new(identity.node_id().clone(), BUCKET_SIZE),
            ban_list: Mutex::new(BanList::new(BAN_LIST_CAPACITY)),
            identity,
            config,
            server,
            events,
            exit_sender,
            running: AtomicBool::new(false),
        }))
    }

    /// Start the receive and refresh loops.
    pub async fn start(self: &Arc<Self>) -> P2pResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(P2pError::AlreadyRunning);
        }
        info!(
            "Starting discovery on {} as {}",
            self.server.local_addr()?,
            self.identity.node_id()
        );

        // Subscribe before spawning so a stop right after start is seen.
        let receive_exit = self.exit_sender.subscribe();
        let refresh_exit = self.exit_sender.subscribe();

        let zelf = Arc::clone(self);
        spawn_task("dpt-receive", async move {
            zelf.receive_loop(receive_exit).await;
        });

        let zelf = Arc::clone(self);
        spawn_task("dpt-refresh", async move {
            zelf.refresh_loop(refresh_exit).await;
        });

        Ok(())
    }

    /// Stop the loops. Pending requests are left to time out on their own.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping discovery");
        let _ = self.exit_sender.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &NodeId {
        self.identity.node_id()
    }

    /// Address the discovery socket is bound to.
    pub fn local_addr(&self) -> P2pResult<SocketAddr> {
        self.server.local_addr()
    }

    /// Endpoint advertised to other nodes.
    pub fn endpoint(&self) -> &Endpoint {
        self.server.endpoint()
    }

    /// Subscribe to peer added/removed events.
    pub fn subscribe(&self) -> broadcast::Receiver<DptEvent> {
        self.events.subscribe()
    }

    pub async fn get_peer(&self, id: &NodeId) -> Option<PeerRecord> {
        self.table.get(id).await.map(|entry| entry.record)
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.table.contains(id).await
    }

    /// Snapshot of every known peer.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.table.records().await
    }

    pub async fn peer_count(&self) -> usize {
        self.table.len().await
    }

    pub async fn is_banned(&self, record: &PeerRecord) -> bool {
        self.ban_list.lock().await.is_banned(record)
    }

    /// Confirm a peer with a ping round trip and insert it into the table.
    ///
    /// Returns the confirmed record: the endpoint that answered and the node
    /// id recovered from its PONG signature. An unreachable peer is banned
    /// for the configured duration so repeated dial attempts back off.
    pub async fn add_peer(self: &Arc<Self>, record: PeerRecord) -> P2pResult<PeerRecord> {
        if &record.id == self.identity.node_id() {
            return Err(DiscoveryError::OwnNodeId.into());
        }
        if self.is_banned(&record).await {
            return Err(P2pError::Banned);
        }
        if let Some(entry) = self.table.get(&record.id).await {
            return Ok(entry.record);
        }

        let confirmed = match self.server.send_ping(&record).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                if matches!(e, P2pError::RequestTimeout(_)) {
                    self.ban(&record).await;
                }
                return Err(e);
            }
        };

        self.insert_confirmed(confirmed).await
    }

    /// Seed the table from a bootstrap node: add it, ask it for the peers
    /// closest to our own id and try each of them in the background.
    pub async fn bootstrap(self: &Arc<Self>, seed: PeerRecord) -> P2pResult<()> {
        let seed = self.add_peer(seed).await?;
        let records = self
            .server
            .find_neighbours(&seed, self.identity.node_id())
            .await?;
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Bootstrap through {} returned {} candidates",
                seed.id,
                records.len()
            );
        }

        for record in records {
            let zelf = Arc::clone(self);
            spawn_task("dpt-bootstrap-add", async move {
                if let Err(e) = zelf.add_peer(record).await {
                    trace!("Bootstrap candidate rejected: {}", e);
                }
            });
        }
        Ok(())
    }

    /// Ban a peer and drop it from the routing table.
    pub async fn ban_peer(&self, record: &PeerRecord, duration: Duration) {
        self.ban_list.lock().await.ban(record, duration);
        counter!("kadmos_dpt_bans").increment(1u64);
        if self.table.remove(&record.id).await.is_some() {
            let _ = self.events.send(DptEvent::PeerRemoved(record.id.clone()));
        }
    }

    /// Drop a peer from the routing table without banning it.
    pub async fn remove_peer(&self, id: &NodeId) -> bool {
        if self.table.remove(id).await.is_some() {
            counter!("kadmos_dpt_peers_removed").increment(1u64);
            let _ = self.events.send(DptEvent::PeerRemoved(id.clone()));
            true
        } else {
            false
        }
    }

    async fn ban(&self, record: &PeerRecord) {
        self.ban_list
            .lock()
            .await
            .ban(record, self.config.ban_duration());
        counter!("kadmos_dpt_bans").increment(1u64);
    }

    async fn insert_confirmed(self: &Arc<Self>, record: PeerRecord) -> P2pResult<PeerRecord> {
        match self.table.insert(record.clone()).await {
            InsertResult::Inserted => {
                self.announce_added(&record);
                Ok(record)
            }
            InsertResult::Updated => Ok(record),
            InsertResult::SelfInsert => Err(DiscoveryError::OwnNodeId.into()),
            InsertResult::BucketFull(oldest) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Bucket full for {}; probing {} oldest entries",
                        record.id,
                        oldest.len()
                    );
                }

                // Liveness round: evict whoever fails to answer, keep the
                // rest fresh. The newcomer only enters if a slot opened.
                let mut evicted = false;
                for candidate in oldest {
                    match self.server.send_ping(&candidate).await {
                        Ok(_) => {
                            self.table.touch(&candidate.id).await;
                        }
                        Err(_) => {
                            self.table.remove(&candidate.id).await;
                            self.ban(&candidate).await;
                            let _ = self.events.send(DptEvent::PeerRemoved(candidate.id));
                            evicted = true;
                        }
                    }
                }

                if evicted {
                    if let InsertResult::Inserted = self.table.insert(record.clone()).await {
                        self.announce_added(&record);
                    }
                }
                // A full bucket of live peers outranks the newcomer, but the
                // round trip still confirmed it for the caller.
                Ok(record)
            }
        }
    }

    fn announce_added(&self, record: &PeerRecord) {
        counter!("kadmos_dpt_peers_added").increment(1u64);
        if log::log_enabled!(log::Level::Debug) {
            debug!("Added peer {} at {:?}", record.id, record.udp_addr());
        }
        let _ = self.events.send(DptEvent::PeerAdded(record.clone()));
    }

    async fn receive_loop(self: Arc<Self>, mut exit: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                biased;
                _ = exit.recv() => break,
                result = self.server.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(value) => value,
                        Err(e) => {
                            if self.is_running() {
                                warn!("Discovery socket error: {}", e);
                            }
                            break;
                        }
                    };
                    counter!("kadmos_dpt_packets_received").increment(1u64);

                    let received = match ReceivedMessage::decode(&buf[..len]) {
                        Ok(received) => received,
                        Err(e) => {
                            if log::log_enabled!(log::Level::Debug) {
                                debug!("Dropping bad packet from {}: {}", from, e);
                            }
                            counter!("kadmos_dpt_packets_dropped").increment(1u64);
                            continue;
                        }
                    };
                    // Our own packets reflected back are of no interest.
                    if &received.node_id == self.identity.node_id() {
                        continue;
                    }

                    self.dispatch(from, received).await;
                }
            }
        }
        debug!("Discovery receive loop ended");
    }

    async fn dispatch(self: &Arc<Self>, from: SocketAddr, received: ReceivedMessage) {
        if log::log_enabled!(log::Level::Trace) {
            trace!(
                "Received packet type {} from {} ({})",
                received.message.message_type(),
                received.node_id,
                from
            );
        }

        // Authenticated traffic from a known node refreshes its slot.
        self.table.touch(&received.node_id).await;

        let ReceivedMessage {
            message,
            node_id,
            hash,
        } = received;

        match message {
            Message::Ping(ping) => {
                self.handle_ping(from, &node_id, &ping, &hash).await;
            }
            Message::Pong(pong) => {
                self.server.resolve_pong(from, &node_id, &pong).await;
            }
            Message::FindNeighbours(find) => {
                self.handle_find_neighbours(from, &find).await;
            }
            Message::Neighbours(neighbours) => {
                self.server
                    .resolve_neighbours(from, &node_id, neighbours.records)
                    .await;
            }
        }
    }

    async fn handle_ping(
        self: &Arc<Self>,
        from: SocketAddr,
        node_id: &NodeId,
        ping: &Ping,
        hash: &Hash,
    ) {
        counter!("kadmos_dpt_pings_received").increment(1u64);

        // Answer to the observed source address, not the claimed endpoint.
        let pong = Pong::new(Endpoint::from_udp_addr(from), hash.clone());
        if let Err(e) = self.server.send_message(Message::Pong(pong), from).await {
            debug!("Failed to answer PING from {}: {}", from, e);
            return;
        }

        if self.table.contains(node_id).await {
            return;
        }

        // The sender knows us but we do not know it. Confirm it with our
        // own round trip shortly, against the observed address plus its
        // claimed TCP port.
        let record = PeerRecord::new(
            node_id.clone(),
            Endpoint::new(from.ip(), Some(from.port()), ping.from.tcp_port),
        );
        let zelf = Arc::clone(self);
        spawn_task("dpt-pending-add", async move {
            sleep(PENDING_ADD_DELAY).await;
            if let Err(e) = zelf.add_peer(record).await {
                trace!("Pinging peer not added: {}", e);
            }
        });
    }

    async fn handle_find_neighbours(&self, from: SocketAddr, find: &FindNeighbours) {
        counter!("kadmos_dpt_find_neighbours_received").increment(1u64);

        let closest = self.table.closest(&find.target, BUCKET_SIZE).await;
        if closest.is_empty() {
            return;
        }

        // Chunked so each datagram stays under the size budget.
        for chunk in closest.chunks(NEIGHBOURS_MAX_PER_PACKET) {
            let reply = Neighbours::new(chunk.to_vec());
            if let Err(e) = self
                .server
                .send_message(Message::Neighbours(reply), from)
                .await
            {
                debug!("Failed to answer FINDNEIGHBOURS from {}: {}", from, e);
                break;
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>, mut exit: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.refresh_interval());
        loop {
            tokio::select! {
                biased;
                _ = exit.recv() => break,
                _ = ticker.tick() => self.refresh().await,
            }
        }
        debug!("Discovery refresh loop ended");
    }

    /// Ask every known node for peers near a fresh random target, merging
    /// whatever comes back through `add_peer`.
    async fn refresh(self: &Arc<Self>) {
        let records = self.table.records().await;
        if records.is_empty() {
            return;
        }
        if log::log_enabled!(log::Level::Debug) {
            debug!("Refreshing routing table against {} nodes", records.len());
        }

        for record in records {
            // A fresh target per node widens coverage of the id space.
            let mut target = [0u8; NODE_ID_SIZE];
            OsRng.fill_bytes(&mut target);
            let target = NodeId::new(target);

            let zelf = Arc::clone(self);
            spawn_task("dpt-refresh-find", async move {
                let found = match zelf.server.find_neighbours(&record, &target).await {
                    Ok(found) => found,
                    Err(e) => {
                        trace!("Refresh query to {} failed: {}", record.id, e);
                        return;
                    }
                };
                for candidate in found {
                    if let Err(e) = zelf.add_peer(candidate).await {
                        trace!("Refresh candidate rejected: {}", e);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{timeout, Duration};

    use super::*;

    fn test_config(request_timeout_secs: u64) -> DptConfig {
        DptConfig {
            request_timeout_secs,
            // Keep the periodic refresh out of the way unless a test wants it.
            refresh_interval_secs: 3600,
            ..Default::default()
        }
    }

    async fn start_dpt(config: DptConfig) -> Arc<Dpt> {
        let identity = Arc::new(NodeIdentity::generate());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let dpt = Dpt::new(identity, addr, config).await.unwrap();
        dpt.start().await.unwrap();
        dpt
    }

    fn record_of(dpt: &Dpt) -> PeerRecord {
        PeerRecord::new(dpt.node_id().clone(), dpt.endpoint().clone())
    }

    async fn wait_until<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("Timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_add_peer_round_trip() {
        let alice = start_dpt(test_config(5)).await;
        let bob = start_dpt(test_config(5)).await;
        let mut events = alice.subscribe();

        let confirmed = alice.add_peer(record_of(&bob)).await.unwrap();
        assert_eq!(&confirmed.id, bob.node_id());
        assert!(alice.contains(bob.node_id()).await);

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, DptEvent::PeerAdded(confirmed));

        // Bob saw the ping from an unknown node and adds Alice back after
        // his own confirmation round trip.
        wait_until("bob to learn alice", || {
            let bob = bob.clone();
            let id = alice.node_id().clone();
            async move { bob.contains(&id).await }
        })
        .await;

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let alice = start_dpt(test_config(5)).await;
        let bob = start_dpt(test_config(5)).await;

        let first = alice.add_peer(record_of(&bob)).await.unwrap();
        let second = alice.add_peer(record_of(&bob)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(alice.peer_count().await, 1);

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_add_banned_peer_fails() {
        let alice = start_dpt(test_config(5)).await;
        let bob = start_dpt(test_config(5)).await;

        let record = record_of(&bob);
        alice.ban_peer(&record, Duration::from_secs(60)).await;

        let err = alice.add_peer(record).await.unwrap_err();
        assert!(matches!(err, P2pError::Banned));
        assert!(!alice.contains(bob.node_id()).await);

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_banned() {
        let alice = start_dpt(test_config(1)).await;
        // A socket that never answers.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let record = PeerRecord::new(
            NodeIdentity::generate().node_id().clone(),
            Endpoint::from_udp_addr(silent.local_addr().unwrap()),
        );

        let err = alice.add_peer(record.clone()).await.unwrap_err();
        assert!(matches!(err, P2pError::RequestTimeout(_)));

        // The failed round trip banned the record; the retry fails fast.
        let err = alice.add_peer(record).await.unwrap_err();
        assert!(matches!(err, P2pError::Banned));

        alice.stop().await;
    }

    #[tokio::test]
    async fn test_add_own_record_fails() {
        let alice = start_dpt(test_config(5)).await;
        let record = record_of(&alice);

        let err = alice.add_peer(record).await.unwrap_err();
        assert!(matches!(
            err,
            P2pError::Discovery(DiscoveryError::OwnNodeId)
        ));

        alice.stop().await;
    }

    #[tokio::test]
    async fn test_remove_peer_emits_event() {
        let alice = start_dpt(test_config(5)).await;
        let bob = start_dpt(test_config(5)).await;

        alice.add_peer(record_of(&bob)).await.unwrap();
        let mut events = alice.subscribe();

        assert!(alice.remove_peer(bob.node_id()).await);
        assert!(!alice.contains(bob.node_id()).await);

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, DptEvent::PeerRemoved(bob.node_id().clone()));

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_bootstrap_discovers_neighbours() {
        let alice = start_dpt(test_config(5)).await;
        let carol = start_dpt(test_config(5)).await;
        let dave = start_dpt(test_config(5)).await;

        // Carol already knows Dave.
        carol.add_peer(record_of(&dave)).await.unwrap();

        alice.bootstrap(record_of(&carol)).await.unwrap();
        assert!(alice.contains(carol.node_id()).await);

        // Dave came back in Carol's NEIGHBOURS answer and gets confirmed in
        // the background.
        wait_until("alice to learn dave", || {
            let alice = alice.clone();
            let id = dave.node_id().clone();
            async move { alice.contains(&id).await }
        })
        .await;

        alice.stop().await;
        carol.stop().await;
        dave.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_merges_new_peers() {
        let mut config = test_config(5);
        config.refresh_interval_secs = 1;
        let alice = start_dpt(config).await;
        let bob = start_dpt(test_config(5)).await;
        let carol = start_dpt(test_config(5)).await;

        bob.add_peer(record_of(&carol)).await.unwrap();
        alice.add_peer(record_of(&bob)).await.unwrap();

        // The next refresh tick queries Bob, who answers with Carol.
        wait_until("alice to learn carol", || {
            let alice = alice.clone();
            let id = carol.node_id().clone();
            async move { alice.contains(&id).await }
        })
        .await;

        alice.stop().await;
        bob.stop().await;
        carol.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let identity = Arc::new(NodeIdentity::generate());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let dpt = Dpt::new(identity, addr, test_config(5)).await.unwrap();

        dpt.start().await.unwrap();
        let err = dpt.start().await.unwrap_err();
        assert!(matches!(err, P2pError::AlreadyRunning));

        dpt.stop().await;
    }
}
