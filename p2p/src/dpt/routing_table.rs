//! Kademlia-style routing table for node discovery.
//!
//! Known nodes are organized into k-buckets by the log2 of their XOR
//! distance from the local node ID. Buckets keep LRU order: least
//! recently seen at the front, so the front entries are the first
//! liveness-probe candidates when a bucket overflows.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::RwLock;

use kadmos_common::crypto::{NodeId, NODE_ID_SIZE};

use super::messages::PeerRecord;
use crate::config::{EVICTION_PROBES, NUM_BUCKETS};

/// Log2 of the XOR distance between two node IDs.
///
/// Doubles as the bucket index, in `0..NUM_BUCKETS`. Returns `None` for
/// identical IDs (distance zero has no logarithm).
pub fn log2_distance(a: &NodeId, b: &NodeId) -> Option<u16> {
    for (i, (x, y)) in a.as_bytes().iter().zip(b.as_bytes().iter()).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            let bit_length = 8 - xor.leading_zeros() as usize;
            let remaining = (NODE_ID_SIZE - 1 - i) * 8;
            return Some((remaining + bit_length - 1) as u16);
        }
    }
    None
}

/// Order two node IDs by XOR distance to a target.
pub fn compare_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    for i in 0..NODE_ID_SIZE {
        let da = a.as_bytes()[i] ^ target.as_bytes()[i];
        let db = b.as_bytes()[i] ^ target.as_bytes()[i];
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Entry in a k-bucket: the peer record plus liveness metadata.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// The peer record.
    pub record: PeerRecord,
    /// When this entry was last seen.
    pub last_seen: Instant,
}

impl NodeEntry {
    fn new(record: PeerRecord) -> Self {
        Self {
            record,
            last_seen: Instant::now(),
        }
    }

    /// Update the last seen time.
    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.record.id
    }
}

/// Result of inserting a node into the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// Node was inserted successfully.
    Inserted,
    /// Node was already in the table and was updated.
    Updated,
    /// Bucket is full; contains the least recently seen records to
    /// liveness-probe before anything may be evicted.
    BucketFull(Vec<PeerRecord>),
    /// Cannot insert self.
    SelfInsert,
}

enum BucketInsert {
    Inserted,
    Updated { previous: PeerRecord },
    Full { oldest: Vec<PeerRecord> },
}

/// A single k-bucket containing nodes at one distance.
#[derive(Debug)]
struct KBucket {
    /// Nodes in LRU order (most recently seen at back).
    nodes: VecDeque<NodeEntry>,
    /// Maximum capacity.
    capacity: usize,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    fn find_index(&self, node_id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|e| &e.record.id == node_id)
    }

    fn get(&self, node_id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.iter().find(|e| &e.record.id == node_id)
    }

    /// Insert or update a node.
    ///
    /// A full bucket yields the oldest entries for liveness probing
    /// instead of evicting anything outright.
    fn insert(&mut self, entry: NodeEntry) -> BucketInsert {
        if let Some(index) = self.find_index(&entry.record.id) {
            // Move to back (most recently seen) and refresh the record
            if let Some(mut existing) = self.nodes.remove(index) {
                let previous = std::mem::replace(&mut existing.record, entry.record);
                existing.touch();
                self.nodes.push_back(existing);
                return BucketInsert::Updated { previous };
            }
        }

        if self.is_full() {
            let oldest = self
                .nodes
                .iter()
                .take(EVICTION_PROBES)
                .map(|e| e.record.clone())
                .collect();
            return BucketInsert::Full { oldest };
        }

        self.nodes.push_back(entry);
        BucketInsert::Inserted
    }

    fn remove(&mut self, node_id: &NodeId) -> Option<NodeEntry> {
        if let Some(index) = self.find_index(node_id) {
            self.nodes.remove(index)
        } else {
            None
        }
    }

    fn touch(&mut self, node_id: &NodeId) -> bool {
        if let Some(index) = self.find_index(node_id) {
            if let Some(mut entry) = self.nodes.remove(index) {
                entry.touch();
                self.nodes.push_back(entry);
                return true;
            }
        }
        false
    }

    fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter()
    }
}

/// Kademlia-style routing table.
///
/// Keyed canonically by node ID; a secondary address index lets the
/// datagram handlers resolve the sender of unsolicited traffic.
pub struct RoutingTable {
    /// Local node ID.
    local_id: NodeId,
    /// K-buckets indexed by log2 distance.
    buckets: Vec<RwLock<KBucket>>,
    /// Bucket capacity (Kademlia k parameter).
    bucket_size: usize,
    /// UDP address to node ID index, maintained by insert and remove.
    by_addr: RwLock<HashMap<SocketAddr, NodeId>>,
}

impl RoutingTable {
    /// Create a new routing table.
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| RwLock::new(KBucket::new(bucket_size)))
            .collect();

        Self {
            local_id,
            buckets,
            bucket_size,
            by_addr: RwLock::new(HashMap::new()),
        }
    }

    /// Get the local node ID.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Get the bucket size.
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Calculate which bucket a node belongs to.
    fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        log2_distance(&self.local_id, node_id).map(|d| d as usize)
    }

    /// Insert a node into the routing table.
    pub async fn insert(&self, record: PeerRecord) -> InsertResult {
        let bucket_idx = match self.bucket_index(&record.id) {
            Some(idx) => idx,
            None => return InsertResult::SelfInsert,
        };

        let id = record.id.clone();
        let udp_addr = record.udp_addr();

        let outcome = {
            let mut bucket = self.buckets[bucket_idx].write().await;
            bucket.insert(NodeEntry::new(record))
        };

        match outcome {
            BucketInsert::Inserted => {
                if let Some(addr) = udp_addr {
                    self.by_addr.write().await.insert(addr, id);
                }
                InsertResult::Inserted
            }
            BucketInsert::Updated { previous } => {
                let previous_addr = previous.udp_addr();
                if previous_addr != udp_addr {
                    let mut index = self.by_addr.write().await;
                    if let Some(addr) = previous_addr {
                        if index.get(&addr) == Some(&id) {
                            index.remove(&addr);
                        }
                    }
                    if let Some(addr) = udp_addr {
                        index.insert(addr, id);
                    }
                }
                InsertResult::Updated
            }
            BucketInsert::Full { oldest } => InsertResult::BucketFull(oldest),
        }
    }

    /// Update a node's last seen time, moving it to the fresh end of its
    /// bucket. Returns false for unknown nodes.
    pub async fn touch(&self, node_id: &NodeId) -> bool {
        if let Some(bucket_idx) = self.bucket_index(node_id) {
            let mut bucket = self.buckets[bucket_idx].write().await;
            return bucket.touch(node_id);
        }
        false
    }

    /// Remove a node from the routing table.
    pub async fn remove(&self, node_id: &NodeId) -> Option<PeerRecord> {
        let bucket_idx = self.bucket_index(node_id)?;
        let removed = {
            let mut bucket = self.buckets[bucket_idx].write().await;
            bucket.remove(node_id)
        };
        let entry = removed?;

        if let Some(addr) = entry.record.udp_addr() {
            let mut index = self.by_addr.write().await;
            if index.get(&addr) == Some(node_id) {
                index.remove(&addr);
            }
        }
        Some(entry.record)
    }

    /// Get a node by ID.
    pub async fn get(&self, node_id: &NodeId) -> Option<NodeEntry> {
        if let Some(bucket_idx) = self.bucket_index(node_id) {
            let bucket = self.buckets[bucket_idx].read().await;
            return bucket.get(node_id).cloned();
        }
        None
    }

    /// Get a node by its UDP address.
    pub async fn get_by_addr(&self, addr: &SocketAddr) -> Option<NodeEntry> {
        // Copy the ID out so the index lock never overlaps a bucket lock
        let id = { self.by_addr.read().await.get(addr).cloned() };
        match id {
            Some(id) => self.get(&id).await,
            None => None,
        }
    }

    /// Check if a node is in the routing table.
    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.get(node_id).await.is_some()
    }

    /// Get the closest records to a target, sorted by XOR distance.
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        let mut candidates = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            for entry in bucket.nodes() {
                candidates.push(entry.record.clone());
            }
        }

        candidates.sort_by(|a, b| compare_distance(target, &a.id, &b.id));
        candidates.truncate(count);
        candidates
    }

    /// Get all records in the routing table.
    pub async fn records(&self) -> Vec<PeerRecord> {
        let mut records = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            for entry in bucket.nodes() {
                records.push(entry.record.clone());
            }
        }
        records
    }

    /// Get the total number of nodes in the routing table.
    pub async fn len(&self) -> usize {
        let mut count: usize = 0;
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            count = count.saturating_add(bucket.len());
        }
        count
    }

    /// Check if the routing table is empty.
    pub async fn is_empty(&self) -> bool {
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            if !bucket.is_empty() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BUCKET_SIZE;
    use crate::dpt::messages::Endpoint;
    use std::net::{IpAddr, Ipv4Addr};

    fn id_with(first: u8, last: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[0] = first;
        bytes[NODE_ID_SIZE - 1] = last;
        NodeId::new(bytes)
    }

    fn record_with(first: u8, last: u8) -> PeerRecord {
        PeerRecord::new(
            id_with(first, last),
            Endpoint::new(
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                Some(40_000 + last as u16),
                None,
            ),
        )
    }

    #[test]
    fn test_log2_distance() {
        let zero = NodeId::new([0u8; NODE_ID_SIZE]);
        assert_eq!(log2_distance(&zero, &zero), None);
        assert_eq!(log2_distance(&zero, &id_with(0x00, 0x01)), Some(0));
        assert_eq!(log2_distance(&zero, &id_with(0x00, 0x80)), Some(7));
        assert_eq!(log2_distance(&zero, &id_with(0x01, 0x00)), Some(504));
        assert_eq!(log2_distance(&zero, &id_with(0x80, 0x00)), Some(511));
    }

    #[test]
    fn test_compare_distance() {
        let target = NodeId::new([0u8; NODE_ID_SIZE]);
        let near = id_with(0x00, 0x01);
        let far = id_with(0x00, 0x02);
        assert_eq!(compare_distance(&target, &near, &far), Ordering::Less);
        assert_eq!(compare_distance(&target, &far, &near), Ordering::Greater);
        assert_eq!(compare_distance(&target, &near, &near), Ordering::Equal);
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let table = RoutingTable::new(NodeId::new([0u8; NODE_ID_SIZE]), BUCKET_SIZE);
        let record = record_with(0x80, 1);

        assert_eq!(table.insert(record.clone()).await, InsertResult::Inserted);
        assert_eq!(table.len().await, 1);
        assert!(table.contains(&record.id).await);

        let entry = table.get(&record.id).await.unwrap();
        assert_eq!(entry.record, record);
    }

    #[tokio::test]
    async fn test_insert_self_fails() {
        let local = id_with(0x80, 1);
        let table = RoutingTable::new(local.clone(), BUCKET_SIZE);

        let record = PeerRecord::new(
            local,
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Some(7513), None),
        );
        assert_eq!(table.insert(record).await, InsertResult::SelfInsert);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_reindexes_address() {
        let table = RoutingTable::new(NodeId::new([0u8; NODE_ID_SIZE]), BUCKET_SIZE);
        let mut record = record_with(0x80, 1);
        table.insert(record.clone()).await;

        let old_addr = record.udp_addr().unwrap();
        record.endpoint.udp_port = Some(50_000);
        assert_eq!(table.insert(record.clone()).await, InsertResult::Updated);
        assert_eq!(table.len().await, 1);

        assert!(table.get_by_addr(&old_addr).await.is_none());
        let entry = table
            .get_by_addr(&record.udp_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(entry.record.id, record.id);
    }

    #[tokio::test]
    async fn test_bucket_full_yields_probe_candidates() {
        // Small buckets; all IDs share the top bit so they land together
        let table = RoutingTable::new(NodeId::new([0u8; NODE_ID_SIZE]), 4);
        for i in 1..=4 {
            assert_eq!(
                table.insert(record_with(0x80, i)).await,
                InsertResult::Inserted
            );
        }

        let result = table.insert(record_with(0x80, 5)).await;
        match result {
            InsertResult::BucketFull(oldest) => {
                assert_eq!(oldest.len(), EVICTION_PROBES);
                // Probe candidates come from the least recently seen end
                assert_eq!(oldest[0].id, id_with(0x80, 1));
                assert_eq!(oldest[1].id, id_with(0x80, 2));
                assert_eq!(oldest[2].id, id_with(0x80, 3));
            }
            other => panic!("expected BucketFull, got {:?}", other),
        }

        // Evicting one frees a slot for the newcomer
        assert!(table.remove(&id_with(0x80, 1)).await.is_some());
        assert_eq!(
            table.insert(record_with(0x80, 5)).await,
            InsertResult::Inserted
        );
        assert_eq!(table.len().await, 4);
    }

    #[tokio::test]
    async fn test_touch_moves_to_back() {
        let table = RoutingTable::new(NodeId::new([0u8; NODE_ID_SIZE]), 2);
        table.insert(record_with(0x80, 1)).await;
        table.insert(record_with(0x80, 2)).await;

        assert!(table.touch(&id_with(0x80, 1)).await);
        assert!(!table.touch(&id_with(0x80, 9)).await);

        // Entry 2 is now the least recently seen
        match table.insert(record_with(0x80, 3)).await {
            InsertResult::BucketFull(oldest) => {
                assert_eq!(oldest[0].id, id_with(0x80, 2));
                assert_eq!(oldest[1].id, id_with(0x80, 1));
            }
            other => panic!("expected BucketFull, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closest_sorted_by_distance() {
        let table = RoutingTable::new(id_with(0x40, 0), BUCKET_SIZE);
        for i in [7u8, 1, 4, 2] {
            table.insert(record_with(0x00, i)).await;
        }

        let target = NodeId::new([0u8; NODE_ID_SIZE]);
        let closest = table.closest(&target, 3).await;

        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].id, id_with(0x00, 1));
        assert_eq!(closest[1].id, id_with(0x00, 2));
        assert_eq!(closest[2].id, id_with(0x00, 4));

        // Asking for more than the table holds returns everything sorted
        let all = table.closest(&target, 16).await;
        assert_eq!(all.len(), 4);
        assert_eq!(all[3].id, id_with(0x00, 7));
    }

    #[tokio::test]
    async fn test_remove_clears_address_index() {
        let table = RoutingTable::new(NodeId::new([0u8; NODE_ID_SIZE]), BUCKET_SIZE);
        let record = record_with(0x80, 1);
        let addr = record.udp_addr().unwrap();
        table.insert(record.clone()).await;

        assert!(table.get_by_addr(&addr).await.is_some());
        let removed = table.remove(&record.id).await.unwrap();
        assert_eq!(removed, record);
        assert!(table.get_by_addr(&addr).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_records_lists_everything() {
        let table = RoutingTable::new(NodeId::new([0u8; NODE_ID_SIZE]), BUCKET_SIZE);
        for i in 1..=5 {
            table.insert(record_with(i, i)).await;
        }
        assert_eq!(table.records().await.len(), 5);
        assert_eq!(table.len().await, 5);
    }
}
