//! Temporary ban list for misbehaving or unreachable nodes.
//!
//! Nodes are banned under two keys at once, their node ID and their UDP
//! address, so neither a key rotation nor an address move slips past the
//! ban before it expires. The backing store is a bounded LRU so the list
//! cannot grow without limit under an address-spraying peer.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use kadmos_common::crypto::NodeId;

use super::messages::PeerRecord;

/// Key a ban is recorded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BanKey {
    Id(NodeId),
    Addr(SocketAddr),
}

/// Bounded ban list with per-entry expiry.
pub struct BanList {
    entries: LruCache<BanKey, Instant>,
}

impl BanList {
    /// Create a new ban list holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Ban a peer under both its keys.
    pub fn ban(&mut self, record: &PeerRecord, duration: Duration) {
        self.ban_id(record.id.clone(), duration);
        if let Some(addr) = record.udp_addr() {
            self.ban_addr(addr, duration);
        }
    }

    /// Ban a node ID.
    pub fn ban_id(&mut self, id: NodeId, duration: Duration) {
        self.entries.put(BanKey::Id(id), Instant::now() + duration);
    }

    /// Ban a UDP address.
    pub fn ban_addr(&mut self, addr: SocketAddr, duration: Duration) {
        self.entries.put(BanKey::Addr(addr), Instant::now() + duration);
    }

    /// Check whether any of a peer's keys is banned.
    pub fn is_banned(&mut self, record: &PeerRecord) -> bool {
        let id_banned = self.is_banned_id(&record.id);
        let addr_banned = match record.udp_addr() {
            Some(addr) => self.is_banned_addr(&addr),
            None => false,
        };
        id_banned || addr_banned
    }

    /// Check whether a node ID is banned.
    pub fn is_banned_id(&mut self, id: &NodeId) -> bool {
        self.check(&BanKey::Id(id.clone()))
    }

    /// Check whether a UDP address is banned.
    pub fn is_banned_addr(&mut self, addr: &SocketAddr) -> bool {
        self.check(&BanKey::Addr(*addr))
    }

    /// Number of live keys, counting entries that have not been lazily
    /// dropped yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Expired entries are dropped on lookup rather than by a sweeper task
    fn check(&mut self, key: &BanKey) -> bool {
        match self.entries.peek(key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                self.entries.pop(key);
                false
            }
            None => false,
        }
    }
}
