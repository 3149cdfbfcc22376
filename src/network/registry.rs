use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::core::PeerId;
use crate::protocol::{Batch, PeerOfflineEvent, SlaveStatusReport};

/// Registry shared between the control loop and the inbound callback
pub type SharedRegistry = Arc<Mutex<PeerRegistry>>;

/// A tracked remote peer
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub id: PeerId,
    /// Unix seconds of the first valid message
    pub first_seen: u64,
    /// Unix seconds of the latest message
    pub last_seen: u64,
    pub is_online: bool,
    pub telemetry_count: u64,
    pub batch_count: u64,
    pub error_count: u64,
    pub last_status: Option<SlaveStatusReport>,
    /// Most recent first
    batches: VecDeque<Batch>,
}

impl PeerEntry {
    fn new(id: PeerId, now: u64) -> Self {
        PeerEntry {
            id,
            first_seen: now,
            last_seen: now,
            is_online: true,
            telemetry_count: 0,
            batch_count: 0,
            error_count: 0,
            last_status: None,
            batches: VecDeque::new(),
        }
    }

    /// Batch history, most recent first
    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.batches.iter()
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            is_online: self.is_online,
            telemetry_count: self.telemetry_count,
            batch_count: self.batch_count,
            error_count: self.error_count,
            buffered_batches: self.batches.len(),
            last_status: self.last_status.clone(),
        }
    }
}

/// Read-only copy of a peer entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub first_seen: u64,
    pub last_seen: u64,
    pub is_online: bool,
    pub telemetry_count: u64,
    pub batch_count: u64,
    pub error_count: u64,
    pub buffered_batches: usize,
    pub last_status: Option<SlaveStatusReport>,
}

/// Summary of one remembered batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: u32,
    pub record_size: u8,
    pub record_count: usize,
    /// Base timestamp for timestamped batches
    pub base_timestamp: Option<u32>,
    #[serde(serialize_with = "crate::core::serde::serialize_hex_list")]
    pub records: Vec<Bytes>,
}

impl From<&Batch> for BatchSummary {
    fn from(batch: &Batch) -> Self {
        BatchSummary {
            batch_id: batch.batch_id(),
            record_size: batch.record_size(),
            record_count: batch.record_count(),
            base_timestamp: match batch {
                Batch::Timestamped(b) => Some(b.base_timestamp),
                Batch::Plain(_) => None,
            },
            records: batch.record_data(),
        }
    }
}

/// Aggregate counters over all peers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_peers: usize,
    pub online_peers: usize,
    pub offline_peers: usize,
    pub total_telemetry: u64,
    pub total_batches: u64,
    pub total_errors: u64,
    /// Registrations refused because the registry was full
    pub rejected_peers: u64,
}

/// Bounded set of known peers
///
/// Peers are never removed; once the set is full new ids are rejected.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
    max_peers: usize,
    history_capacity: usize,
    rejected: u64,
}

impl PeerRegistry {
    pub fn new(max_peers: usize, history_capacity: usize) -> Self {
        PeerRegistry {
            peers: HashMap::new(),
            max_peers,
            history_capacity,
            rejected: 0,
        }
    }

    /// Wraps the registry for sharing
    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Returns the entry for `id`, creating it if there is room
    ///
    /// Returns `None` and counts a rejection when the registry is full.
    pub fn get_or_create(&mut self, id: &PeerId, now: u64) -> Option<&mut PeerEntry> {
        if !self.peers.contains_key(id) {
            if self.peers.len() >= self.max_peers {
                self.rejected += 1;
                warn!(peer = %id, max = self.max_peers, "Peer registry full, rejecting peer");
                return None;
            }
            info!(peer = %id, "New peer discovered");
            self.peers.insert(id.clone(), PeerEntry::new(id.clone(), now));
        }
        self.peers.get_mut(id)
    }

    /// Marks a known peer as seen at `now`
    pub fn touch(&mut self, id: &PeerId, now: u64) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                if !peer.is_online {
                    info!(peer = %id, "Peer back online");
                }
                peer.last_seen = peer.last_seen.max(now);
                peer.is_online = true;
                true
            }
            None => false,
        }
    }

    /// Remembers a batch, dropping the oldest beyond capacity
    ///
    /// Every delivery counts, redeliveries of the same batch id included.
    /// Returns false for an unknown peer.
    pub fn record_batch(&mut self, id: &PeerId, batch: Batch) -> bool {
        let capacity = self.history_capacity;
        let peer = match self.peers.get_mut(id) {
            Some(peer) => peer,
            None => return false,
        };
        peer.batch_count += 1;
        if capacity > 0 {
            peer.batches.push_front(batch);
            peer.batches.truncate(capacity);
        }
        true
    }

    pub fn record_status(&mut self, id: &PeerId, report: SlaveStatusReport) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_status = Some(report);
                true
            }
            None => false,
        }
    }

    pub fn record_telemetry(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.telemetry_count += 1;
                true
            }
            None => false,
        }
    }

    /// Counts a decode failure against a known peer
    pub fn record_error(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.error_count += 1;
                true
            }
            None => false,
        }
    }

    /// Marks peers silent for at least `timeout_secs` as offline
    ///
    /// Only the online to offline transition is reported; a peer that stays
    /// offline is not reported again.
    pub fn sweep(&mut self, now: u64, timeout_secs: u64) -> Vec<PeerOfflineEvent> {
        let mut offline = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.is_online && now.saturating_sub(peer.last_seen) >= timeout_secs {
                peer.is_online = false;
                info!(peer = %peer.id, last_seen = peer.last_seen, "Peer went offline");
                offline.push(PeerOfflineEvent {
                    peer: peer.id.clone(),
                    last_seen: peer.last_seen,
                });
            }
        }
        if !offline.is_empty() {
            debug!(count = offline.len(), "Liveness sweep marked peers offline");
        }
        offline
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerSnapshot> {
        self.peers.get(id).map(PeerEntry::snapshot)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// All peers ordered by id
    pub fn list(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<_> = self.peers.values().map(PeerEntry::snapshot).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn online(&self) -> Vec<PeerSnapshot> {
        self.list().into_iter().filter(|p| p.is_online).collect()
    }

    /// Up to `limit` most recent batches of a peer, newest first
    pub fn batches(&self, id: &PeerId, limit: usize) -> Option<Vec<Batch>> {
        self.peers
            .get(id)
            .map(|peer| peer.batches.iter().take(limit).cloned().collect())
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_peers: self.peers.len(),
            rejected_peers: self.rejected,
            ..RegistryStats::default()
        };
        for peer in self.peers.values() {
            if peer.is_online {
                stats.online_peers += 1;
            }
            stats.total_telemetry += peer.telemetry_count;
            stats.total_batches += peer.batch_count;
            stats.total_errors += peer.error_count;
        }
        stats.offline_peers = stats.total_peers - stats.online_peers;
        stats
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DataBatch;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn plain(batch_id: u32) -> Batch {
        Batch::Plain(DataBatch::from_records(batch_id, vec![Bytes::from_static(&[1, 2])]).unwrap())
    }

    #[test]
    fn test_capacity_rejects_newest() {
        let mut registry = PeerRegistry::new(3, 10);
        for i in 0..3 {
            assert!(registry.get_or_create(&peer(&format!("!{:08x}", i)), 0).is_some());
        }
        assert!(registry.get_or_create(&peer("!ffffffff"), 0).is_none());
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.rejected_count(), 1);
        assert!(!registry.contains(&peer("!ffffffff")));

        // Existing peers are still served at capacity
        assert!(registry.get_or_create(&peer("!00000001"), 5).is_some());
        assert_eq!(registry.stats().rejected_peers, 1);
    }

    #[test]
    fn test_sweep_reports_transition_once() {
        let mut registry = PeerRegistry::new(8, 10);
        let p = peer("!a1b2c3d4");
        registry.get_or_create(&p, 0);

        assert!(registry.sweep(299, 300).is_empty());

        let offline = registry.sweep(301, 300);
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].peer, p);
        assert!(!registry.get(&p).unwrap().is_online);

        assert!(registry.sweep(600, 300).is_empty());
    }

    #[test]
    fn test_touch_brings_peer_back() {
        let mut registry = PeerRegistry::new(8, 10);
        let p = peer("!0000beef");
        registry.get_or_create(&p, 0);
        registry.sweep(400, 300);

        assert!(registry.touch(&p, 500));
        let snapshot = registry.get(&p).unwrap();
        assert!(snapshot.is_online);
        assert_eq!(snapshot.last_seen, 500);
        assert_eq!(snapshot.first_seen, 0);

        assert_eq!(registry.sweep(800, 300).len(), 1);
        assert!(!registry.touch(&peer("!unknown"), 500));
    }

    #[test]
    fn test_history_is_bounded_most_recent_first() {
        let mut registry = PeerRegistry::new(8, 3);
        let p = peer("!00000042");
        registry.get_or_create(&p, 0);
        for id in 1..=5 {
            registry.record_batch(&p, plain(id));
        }

        let ids: Vec<u32> = registry.batches(&p, 10).unwrap().iter().map(Batch::batch_id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(registry.batches(&p, 1).unwrap().len(), 1);
        assert_eq!(registry.get(&p).unwrap().batch_count, 5);
    }

    #[test]
    fn test_redelivered_batch_counts_again() {
        let mut registry = PeerRegistry::new(8, 4);
        let p = peer("!00000042");
        registry.get_or_create(&p, 0);
        registry.record_batch(&p, plain(7));
        registry.record_batch(&p, plain(8));
        registry.record_batch(&p, plain(7));

        let ids: Vec<u32> = registry.batches(&p, 10).unwrap().iter().map(Batch::batch_id).collect();
        assert_eq!(ids, vec![7, 8, 7]);
        assert_eq!(registry.get(&p).unwrap().batch_count, 3);
    }

    #[test]
    fn test_counters_and_stats() {
        let mut registry = PeerRegistry::new(8, 3);
        let a = peer("!0000000a");
        let b = peer("!0000000b");
        registry.get_or_create(&a, 0);
        registry.get_or_create(&b, 100);

        registry.record_error(&a);
        registry.record_telemetry(&a);
        registry.record_telemetry(&b);
        assert!(registry.record_batch(&b, plain(1)));
        assert!(registry.record_batch(&b, plain(1)));
        assert!(!registry.record_batch(&peer("!missing"), plain(1)));
        assert!(!registry.record_error(&peer("!missing")));

        registry.sweep(150, 100);
        let stats = registry.stats();
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.online_peers, 1);
        assert_eq!(stats.offline_peers, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.total_telemetry, 2);
        assert_eq!(stats.total_batches, 2);

        let listed: Vec<_> = registry.list().into_iter().map(|p| p.id).collect();
        assert_eq!(listed, vec![a, b.clone()]);
        assert_eq!(registry.online().len(), 1);
        assert_eq!(registry.online()[0].id, b);
    }

    #[test]
    fn test_batch_summary_serializes_hex() {
        let summary = BatchSummary::from(&plain(9));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["batch_id"], 9);
        assert_eq!(json["records"][0], "0102");
        assert!(json["base_timestamp"].is_null());
    }
}
