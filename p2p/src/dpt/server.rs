//! UDP transport for the discovery protocol.
//!
//! Owns the socket and the pending-request bookkeeping: outbound PINGs are
//! keyed by their packet hash, outbound FINDNEIGHBOURS by the queried node
//! id, and each slot carries a broadcast sender so concurrent callers share
//! one round trip. Inbound PONG and NEIGHBOURS packets resolve those slots;
//! inbound PING and FINDNEIGHBOURS are answered by the manager, which owns
//! the routing table.

use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use lru::LruCache;
use metrics::counter;
use tokio::{
    net::UdpSocket,
    sync::{broadcast, Mutex},
    time::timeout,
};

use kadmos_common::crypto::{Hash, NodeId, NodeIdentity};

use crate::{
    config::{
        DptConfig, MAX_DATAGRAM_SIZE, MAX_PENDING_REQUESTS, PING_DEDUP_CAPACITY, PING_DEDUP_TTL,
    },
    dpt::messages::{Endpoint, FindNeighbours, Message, PeerRecord, Ping, Pong},
    error::{DiscoveryError, P2pError, P2pResult},
};

// A PING waiting for its PONG, keyed by the packet hash the PONG echoes.
struct PendingPing {
    // Record as requested; the endpoint is authoritative for the reply.
    record: PeerRecord,
    sender: broadcast::Sender<PeerRecord>,
    sent_at: Instant,
}

// A FINDNEIGHBOURS waiting for a NEIGHBOURS reply from one node id.
struct PendingFind {
    addr: SocketAddr,
    sender: broadcast::Sender<Vec<PeerRecord>>,
    sent_at: Instant,
}

// Dedup entry for pings to a single address.
struct RecentPing {
    created: Instant,
    state: PingState,
}

enum PingState {
    InFlight(broadcast::Sender<PeerRecord>),
    Answered(PeerRecord),
}

/// Discovery socket plus request/response correlation state.
pub struct DptServer {
    identity: Arc<NodeIdentity>,
    socket: Arc<UdpSocket>,
    // Endpoint advertised in outbound PINGs.
    endpoint: Endpoint,
    request_timeout: Duration,
    pending_pings: Mutex<HashMap<Hash, PendingPing>>,
    pending_finds: Mutex<HashMap<NodeId, PendingFind>>,
    recent_pings: Mutex<LruCache<SocketAddr, RecentPing>>,
}

impl DptServer {
    /// Bind the discovery socket.
    pub async fn bind(
        identity: Arc<NodeIdentity>,
        bind_addr: SocketAddr,
        config: &DptConfig,
    ) -> P2pResult<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local = socket.local_addr()?;
        let udp_port = config.advertised_udp_port.unwrap_or_else(|| local.port());
        let endpoint = Endpoint::new(local.ip(), Some(udp_port), config.advertised_tcp_port);
        info!("Discovery listening on {}", local);

        Ok(Self {
            identity,
            socket: Arc::new(socket),
            endpoint,
            request_timeout: config.request_timeout(),
            pending_pings: Mutex::new(HashMap::new()),
            pending_finds: Mutex::new(HashMap::new()),
            recent_pings: Mutex::new(LruCache::new(
                NonZeroUsize::new(PING_DEDUP_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    pub fn local_addr(&self) -> P2pResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Endpoint advertised to other nodes.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> P2pResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    /// Encode, sign and send a message; returns the packet hash.
    pub async fn send_message(&self, message: Message, addr: SocketAddr) -> P2pResult<Hash> {
        let (packet, hash) = message.encode(&self.identity)?;
        self.send_packet(&packet, message.message_type(), addr)
            .await?;
        Ok(hash)
    }

    async fn send_packet(&self, packet: &[u8], msg_type: u8, addr: SocketAddr) -> P2pResult<()> {
        if packet.len() > MAX_DATAGRAM_SIZE {
            return Err(DiscoveryError::PacketTooLarge(packet.len(), MAX_DATAGRAM_SIZE).into());
        }

        if log::log_enabled!(log::Level::Trace) {
            trace!(
                "Sending packet type {} ({} bytes) to {}",
                msg_type,
                packet.len(),
                addr
            );
        }

        self.socket.send_to(packet, addr).await?;
        counter!("kadmos_dpt_packets_sent").increment(1u64);
        Ok(())
    }

    /// Ping a node and wait for its PONG.
    ///
    /// Resolves with the confirmed record: the endpoint that was pinged and
    /// the node id recovered from the PONG signature, so a node lying about
    /// its id gets corrected by its own reply. Concurrent pings to the same
    /// address within the dedup window normally share one round trip; a
    /// failed or timed-out request clears the window at once.
    pub async fn send_ping(&self, record: &PeerRecord) -> P2pResult<PeerRecord> {
        let addr = record
            .udp_addr()
            .ok_or(DiscoveryError::MissingUdpEndpoint)?;

        let shared = {
            let mut recent = self.recent_pings.lock().await;
            match recent.get(&addr) {
                Some(entry) if entry.created.elapsed() < PING_DEDUP_TTL => match &entry.state {
                    PingState::Answered(resolved) => return Ok(resolved.clone()),
                    PingState::InFlight(sender) => Some(sender.subscribe()),
                },
                _ => None,
            }
        };

        if let Some(mut receiver) = shared {
            return match timeout(self.request_timeout, receiver.recv()).await {
                Ok(Ok(resolved)) => Ok(resolved),
                _ => Err(P2pError::RequestTimeout(addr)),
            };
        }

        let message = Message::Ping(Ping::new(self.endpoint.clone(), record.endpoint.clone()));
        let (packet, hash) = message.encode(&self.identity)?;
        let msg_type = message.message_type();
        let (sender, mut receiver) = broadcast::channel(1);
        let started = Instant::now();

        // Register before sending so a reply can never race the bookkeeping.
        {
            let mut pending = self.pending_pings.lock().await;
            if pending.len() >= MAX_PENDING_REQUESTS {
                let deadline = self.request_timeout;
                pending.retain(|_, slot| slot.sent_at.elapsed() < deadline);
                if pending.len() >= MAX_PENDING_REQUESTS {
                    return Err(DiscoveryError::TooManyRequests.into());
                }
            }
            pending.insert(
                hash.clone(),
                PendingPing {
                    record: record.clone(),
                    sender: sender.clone(),
                    sent_at: started,
                },
            );
        }
        {
            let mut recent = self.recent_pings.lock().await;
            recent.put(
                addr,
                RecentPing {
                    created: started,
                    state: PingState::InFlight(sender),
                },
            );
        }

        if let Err(e) = self.send_packet(&packet, msg_type, addr).await {
            self.clear_ping_request(&hash, addr, started).await;
            return Err(e);
        }
        counter!("kadmos_dpt_pings_sent").increment(1u64);

        match timeout(self.request_timeout, receiver.recv()).await {
            Ok(Ok(resolved)) => Ok(resolved),
            _ => {
                // The owner clears both maps; dropping the senders fails any
                // sharers over immediately instead of leaving them to wait
                // out their own timers.
                self.clear_ping_request(&hash, addr, started).await;
                counter!("kadmos_dpt_request_timeouts").increment(1u64);
                Err(P2pError::RequestTimeout(addr))
            }
        }
    }

    // Drop a failed ping's bookkeeping. The dedup entry is popped only when
    // it still belongs to this attempt; a newer in-flight entry stays.
    async fn clear_ping_request(&self, hash: &Hash, addr: SocketAddr, created: Instant) {
        self.pending_pings.lock().await.remove(hash);

        let mut recent = self.recent_pings.lock().await;
        let ours = recent
            .peek(&addr)
            .map_or(false, |entry| entry.created == created);
        if ours {
            recent.pop(&addr);
        }
    }

    /// Ask a node for the peers it knows closest to `target`.
    ///
    /// Only one FINDNEIGHBOURS per remote node is in flight at a time;
    /// later callers subscribe to the pending request.
    pub async fn find_neighbours(
        &self,
        record: &PeerRecord,
        target: &NodeId,
    ) -> P2pResult<Vec<PeerRecord>> {
        let addr = record
            .udp_addr()
            .ok_or(DiscoveryError::MissingUdpEndpoint)?;

        let (mut receiver, owned) = {
            let mut pending = self.pending_finds.lock().await;
            if let Some(slot) = pending.get(&record.id) {
                (slot.sender.subscribe(), false)
            } else {
                if pending.len() >= MAX_PENDING_REQUESTS {
                    let deadline = self.request_timeout;
                    pending.retain(|_, slot| slot.sent_at.elapsed() < deadline);
                    if pending.len() >= MAX_PENDING_REQUESTS {
                        return Err(DiscoveryError::TooManyRequests.into());
                    }
                }
                let (sender, receiver) = broadcast::channel(1);
                pending.insert(
                    record.id.clone(),
                    PendingFind {
                        addr,
                        sender,
                        sent_at: Instant::now(),
                    },
                );
                (receiver, true)
            }
        };

        if owned {
            let message = Message::FindNeighbours(FindNeighbours::new(target.clone()));
            if let Err(e) = self.send_message(message, addr).await {
                self.pending_finds.lock().await.remove(&record.id);
                return Err(e);
            }
            counter!("kadmos_dpt_find_neighbours_sent").increment(1u64);
        }

        match timeout(self.request_timeout, receiver.recv()).await {
            Ok(Ok(records)) => Ok(records),
            _ => {
                if owned {
                    self.pending_finds.lock().await.remove(&record.id);
                    counter!("kadmos_dpt_request_timeouts").increment(1u64);
                }
                Err(P2pError::RequestTimeout(addr))
            }
        }
    }

    /// Resolve a pending ping with an inbound PONG.
    ///
    /// Returns the confirmed record when the PONG matched a request from
    /// the same address, `None` for unsolicited or mismatched packets.
    pub async fn resolve_pong(
        &self,
        from: SocketAddr,
        node_id: &NodeId,
        pong: &Pong,
    ) -> Option<PeerRecord> {
        let slot = self.pending_pings.lock().await.remove(&pong.echoed_hash);
        let Some(slot) = slot else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Unsolicited PONG from {}", from);
            }
            counter!("kadmos_dpt_unsolicited_packets").increment(1u64);
            return None;
        };

        // The slot is consumed either way; a reply from the wrong address
        // burns the request rather than confirming an endpoint nobody
        // answered at.
        if slot.record.udp_addr() != Some(from) {
            warn!("PONG for {} arrived from {}", slot.record.id, from);
            return None;
        }

        let resolved = PeerRecord::new(node_id.clone(), slot.record.endpoint.clone());

        // Callers landing in the dedup window after resolution get the
        // answer without another round trip.
        {
            let mut recent = self.recent_pings.lock().await;
            if let Some(entry) = recent.get_mut(&from) {
                entry.state = PingState::Answered(resolved.clone());
            }
        }

        let _ = slot.sender.send(resolved.clone());
        Some(resolved)
    }

    /// Resolve a pending neighbours query with an inbound NEIGHBOURS.
    ///
    /// Returns whether a pending request existed for the sender.
    pub async fn resolve_neighbours(
        &self,
        from: SocketAddr,
        node_id: &NodeId,
        records: Vec<PeerRecord>,
    ) -> bool {
        let slot = self.pending_finds.lock().await.remove(node_id);
        let Some(slot) = slot else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Unsolicited NEIGHBOURS from {}", from);
            }
            counter!("kadmos_dpt_unsolicited_packets").increment(1u64);
            return false;
        };

        if slot.addr != from {
            // The signature already proved the id; note the address change
            // but deliver the records.
            debug!(
                "NEIGHBOURS for the request sent to {} answered from {}",
                slot.addr, from
            );
        }

        let _ = slot.sender.send(records);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kadmos_common::crypto::keccak256;

    use super::*;
    use crate::dpt::messages::{Neighbours, ReceivedMessage};

    async fn bind_server(timeout_secs: u64) -> Arc<DptServer> {
        let identity = Arc::new(NodeIdentity::generate());
        let config = DptConfig {
            request_timeout_secs: timeout_secs,
            ..Default::default()
        };
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        Arc::new(DptServer::bind(identity, addr, &config).await.unwrap())
    }

    fn record_for(server: &DptServer) -> PeerRecord {
        let addr = server.local_addr().unwrap();
        PeerRecord::new(
            server.identity.node_id().clone(),
            Endpoint::from_udp_addr(addr),
        )
    }

    // Answers PINGs with PONGs and FINDNEIGHBOURS with a fixed record list,
    // counting the pings it saw.
    fn spawn_responder(server: Arc<DptServer>, pings: Arc<AtomicUsize>, records: Vec<PeerRecord>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let Ok((len, from)) = server.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(received) = ReceivedMessage::decode(&buf[..len]) else {
                    continue;
                };
                match received.message {
                    Message::Ping(_) => {
                        pings.fetch_add(1, Ordering::SeqCst);
                        let pong = Pong::new(Endpoint::from_udp_addr(from), received.hash.clone());
                        let _ = server.send_message(Message::Pong(pong), from).await;
                    }
                    Message::FindNeighbours(_) => {
                        let reply = Neighbours::new(records.clone());
                        let _ = server.send_message(Message::Neighbours(reply), from).await;
                    }
                    _ => {}
                }
            }
        });
    }

    // Drives response resolution the way the manager receive loop does.
    fn spawn_resolver(server: Arc<DptServer>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let Ok((len, from)) = server.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(received) = ReceivedMessage::decode(&buf[..len]) else {
                    continue;
                };
                match received.message {
                    Message::Pong(pong) => {
                        server.resolve_pong(from, &received.node_id, &pong).await;
                    }
                    Message::Neighbours(neighbours) => {
                        server
                            .resolve_neighbours(from, &received.node_id, neighbours.records)
                            .await;
                    }
                    _ => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let alice = bind_server(5).await;
        let bob = bind_server(5).await;
        let pings = Arc::new(AtomicUsize::new(0));
        spawn_responder(bob.clone(), pings.clone(), Vec::new());
        spawn_resolver(alice.clone());

        let resolved = alice.send_ping(&record_for(&bob)).await.unwrap();
        assert_eq!(&resolved.id, bob.identity.node_id());
        assert_eq!(resolved.udp_addr(), Some(bob.local_addr().unwrap()));
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ping_shares_round_trip() {
        let alice = bind_server(5).await;
        let bob = bind_server(5).await;
        let pings = Arc::new(AtomicUsize::new(0));
        spawn_responder(bob.clone(), pings.clone(), Vec::new());
        spawn_resolver(alice.clone());

        let record = record_for(&bob);
        let first = alice.send_ping(&record).await.unwrap();
        // Within the dedup window the answer is served from the cache.
        let second = alice.send_ping(&record).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ping_times_out_without_reply() {
        let alice = bind_server(1).await;
        // Bound but never reads, so the ping goes unanswered.
        let silent = bind_server(1).await;

        let err = alice.send_ping(&record_for(&silent)).await.unwrap_err();
        assert!(matches!(err, P2pError::RequestTimeout(_)));
        assert!(alice.pending_pings.lock().await.is_empty());
        // The dedup entry dies with the request; the next caller starts a
        // fresh round trip instead of waiting on the dead one.
        let addr = silent.local_addr().unwrap();
        assert!(alice.recent_pings.lock().await.peek(&addr).is_none());
    }

    #[tokio::test]
    async fn test_failed_send_clears_dedup_window() {
        let alice = bind_server(5).await;
        // An IPv6 destination on the IPv4 socket makes the send itself fail.
        let record = PeerRecord::new(
            NodeIdentity::generate().node_id().clone(),
            Endpoint::new("::1".parse().unwrap(), Some(9), None),
        );
        let addr = record.udp_addr().unwrap();

        let err = alice.send_ping(&record).await.unwrap_err();
        assert!(matches!(err, P2pError::Io(_)));
        assert!(alice.pending_pings.lock().await.is_empty());
        assert!(alice.recent_pings.lock().await.peek(&addr).is_none());
    }

    #[tokio::test]
    async fn test_find_neighbours_round_trip() {
        let alice = bind_server(5).await;
        let bob = bind_server(5).await;
        let known = vec![
            PeerRecord::new(
                NodeIdentity::generate().node_id().clone(),
                Endpoint::new("10.0.0.1".parse().unwrap(), Some(7513), Some(7512)),
            ),
            PeerRecord::new(
                NodeIdentity::generate().node_id().clone(),
                Endpoint::new("10.0.0.2".parse().unwrap(), Some(7513), None),
            ),
        ];
        spawn_responder(bob.clone(), Arc::new(AtomicUsize::new(0)), known.clone());
        spawn_resolver(alice.clone());

        let target = NodeIdentity::generate().node_id().clone();
        let records = alice
            .find_neighbours(&record_for(&bob), &target)
            .await
            .unwrap();
        assert_eq!(records, known);
    }

    #[tokio::test]
    async fn test_unsolicited_pong_is_dropped() {
        let alice = bind_server(5).await;
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let stranger = NodeIdentity::generate();
        let pong = Pong::new(Endpoint::from_udp_addr(from), keccak256(b"never sent"));

        let resolved = alice.resolve_pong(from, stranger.node_id(), &pong).await;
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_ping_requires_udp_endpoint() {
        let alice = bind_server(5).await;
        let record = PeerRecord::new(
            NodeIdentity::generate().node_id().clone(),
            Endpoint::new("10.0.0.3".parse().unwrap(), None, Some(7512)),
        );

        let err = alice.send_ping(&record).await.unwrap_err();
        assert!(matches!(
            err,
            P2pError::Discovery(DiscoveryError::MissingUdpEndpoint)
        ));
    }
}
