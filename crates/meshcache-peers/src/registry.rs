//! The peer registry.
//!
//! Owns [`PeerRecord`] lifecycle exclusively: records are created on a
//! successful handshake or bootstrap configuration, marked disconnected
//! after a silence window, and never removed solely because of gossip
//! churn.

use meshcache_core::{time, PeerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Registry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// Transport not started yet.
    Uninitialized,
    /// Transport bound, no peers yet.
    Listening,
    /// At least one peer connected.
    Steady,
    /// Transport could not bind; the cache continues local-only.
    Disabled,
}

/// A known remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable cryptographic identifier.
    pub peer_id: PeerId,
    /// Reachable `host:port` addresses.
    pub addresses: BTreeSet<String>,
    /// Unix seconds of the last message from this peer.
    pub last_seen: u64,
    /// Whether the peer is currently considered reachable.
    pub connected: bool,
}

/// Compact peer description exchanged in GOSSIP_PEERS messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAdvert {
    /// Advertised peer id.
    pub peer_id: PeerId,
    /// Advertised addresses.
    pub addresses: Vec<String>,
}

impl From<&PeerRecord> for PeerAdvert {
    fn from(record: &PeerRecord) -> Self {
        Self {
            peer_id: record.peer_id,
            addresses: record.addresses.iter().cloned().collect(),
        }
    }
}

/// Tracks every peer this node has heard of.
pub struct PeerRegistry {
    local_id: PeerId,
    state: RwLock<RegistryState>,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    /// Seconds of silence before a peer is marked disconnected.
    silence_window: u64,
}

impl PeerRegistry {
    /// Create an empty registry for the local node.
    pub fn new(local_id: PeerId, silence_window_secs: u64) -> Self {
        Self {
            local_id,
            state: RwLock::new(RegistryState::Uninitialized),
            peers: RwLock::new(HashMap::new()),
            silence_window: silence_window_secs,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegistryState {
        *self.state.read()
    }

    /// Advance the lifecycle state.
    pub fn set_state(&self, state: RegistryState) {
        let mut current = self.state.write();
        if *current != state {
            info!(from = ?*current, to = ?state, "Registry state change");
            *current = state;
        }
    }

    /// Record a successful handshake with a peer at `address`.
    pub fn peer_connected(&self, peer_id: PeerId, address: Option<String>) {
        if peer_id == self.local_id {
            return;
        }
        let now = time::now_seconds();
        {
            let mut peers = self.peers.write();
            let record = peers.entry(peer_id).or_insert_with(|| PeerRecord {
                peer_id,
                addresses: BTreeSet::new(),
                last_seen: now,
                connected: true,
            });
            if let Some(address) = address {
                record.addresses.insert(address);
            }
            record.last_seen = now;
            record.connected = true;
        }
        if self.state() == RegistryState::Listening {
            self.set_state(RegistryState::Steady);
        }
        debug!(peer = %peer_id.short(), "Peer connected");
    }

    /// Mark a peer unreachable. The record stays.
    pub fn peer_disconnected(&self, peer_id: PeerId) {
        if let Some(record) = self.peers.write().get_mut(&peer_id) {
            record.connected = false;
        }
    }

    /// Refresh `last_seen`. Called on every received message.
    pub fn mark_seen(&self, peer_id: PeerId) {
        if let Some(record) = self.peers.write().get_mut(&peer_id) {
            record.last_seen = time::now_seconds();
            record.connected = true;
        }
    }

    /// Merge gossiped peer adverts. An already known peer keeps the union
    /// of its address set and its most recent `last_seen`; unknown peers
    /// are recorded as disconnected candidates for future dials.
    pub fn merge_adverts(&self, adverts: &[PeerAdvert]) {
        let mut peers = self.peers.write();
        for advert in adverts {
            if advert.peer_id == self.local_id {
                continue;
            }
            match peers.get_mut(&advert.peer_id) {
                Some(record) => {
                    record.addresses.extend(advert.addresses.iter().cloned());
                }
                None => {
                    peers.insert(
                        advert.peer_id,
                        PeerRecord {
                            peer_id: advert.peer_id,
                            addresses: advert.addresses.iter().cloned().collect(),
                            last_seen: 0,
                            connected: false,
                        },
                    );
                }
            }
        }
    }

    /// Known peers, deduplicated by id, capped at `max_peers`. Connected
    /// and recently seen peers sort first.
    pub fn known_peers(&self, max_peers: usize) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.peers.read().values().cloned().collect();
        records.sort_by(|a, b| {
            b.connected
                .cmp(&a.connected)
                .then(b.last_seen.cmp(&a.last_seen))
        });
        records.truncate(max_peers);
        records
    }

    /// Currently connected peers.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|r| r.connected)
            .cloned()
            .collect()
    }

    /// Number of currently connected peers.
    pub fn connected_count(&self) -> usize {
        self.peers.read().values().filter(|r| r.connected).count()
    }

    /// Adverts describing known peers, for answering gossip requests.
    pub fn adverts(&self, max_peers: usize) -> Vec<PeerAdvert> {
        self.known_peers(max_peers)
            .iter()
            .map(PeerAdvert::from)
            .collect()
    }

    /// Mark peers silent for longer than the silence window disconnected.
    pub fn prune_silent(&self) {
        let now = time::now_seconds();
        let mut peers = self.peers.write();
        for record in peers.values_mut() {
            if record.connected && now.saturating_sub(record.last_seen) > self.silence_window {
                debug!(peer = %record.peer_id.short(), "Peer silent past window");
                record.connected = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(id(0), 600)
    }

    #[test]
    fn handshake_creates_a_connected_record() {
        let reg = registry();
        reg.set_state(RegistryState::Listening);
        reg.peer_connected(id(1), Some("10.0.0.1:9400".to_string()));

        let peers = reg.connected_peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].connected);
        assert_eq!(reg.state(), RegistryState::Steady);
    }

    #[test]
    fn own_id_is_never_recorded() {
        let reg = registry();
        reg.peer_connected(id(0), Some("127.0.0.1:1".to_string()));
        reg.merge_adverts(&[PeerAdvert {
            peer_id: id(0),
            addresses: vec!["127.0.0.1:2".to_string()],
        }]);
        assert!(reg.known_peers(10).is_empty());
    }

    #[test]
    fn merge_unions_addresses_and_keeps_last_seen() {
        let reg = registry();
        reg.peer_connected(id(1), Some("10.0.0.1:9400".to_string()));
        let seen_before = reg.known_peers(10)[0].last_seen;

        reg.merge_adverts(&[PeerAdvert {
            peer_id: id(1),
            addresses: vec!["192.168.0.5:9400".to_string()],
        }]);

        let peers = reg.known_peers(10);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addresses.len(), 2);
        assert_eq!(peers[0].last_seen, seen_before);
    }

    #[test]
    fn known_peers_is_capped_and_deduplicated() {
        let reg = registry();
        for seed in 1..=8 {
            reg.merge_adverts(&[PeerAdvert {
                peer_id: id(seed),
                addresses: vec![format!("10.0.0.{}:9400", seed)],
            }]);
        }
        // Duplicate adverts for the same peer must not create duplicates.
        reg.merge_adverts(&[PeerAdvert {
            peer_id: id(1),
            addresses: vec!["10.9.9.9:9400".to_string()],
        }]);

        let peers = reg.known_peers(5);
        assert_eq!(peers.len(), 5);
        let mut ids: Vec<_> = peers.iter().map(|p| p.peer_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn explicit_disconnect_keeps_the_record() {
        let reg = registry();
        reg.peer_connected(id(1), Some("10.0.0.1:9400".to_string()));
        reg.peer_disconnected(id(1));
        assert_eq!(reg.connected_count(), 0);
        assert_eq!(reg.known_peers(10).len(), 1);
    }

    #[test]
    fn gossip_churn_never_removes_records() {
        let reg = registry();
        reg.peer_connected(id(1), Some("10.0.0.1:9400".to_string()));
        // Gossip that no longer mentions peer 1.
        reg.merge_adverts(&[PeerAdvert {
            peer_id: id(2),
            addresses: vec!["10.0.0.2:9400".to_string()],
        }]);
        assert_eq!(reg.known_peers(10).len(), 2);
    }

    #[test]
    fn silent_peers_are_marked_disconnected_not_removed() {
        let reg = PeerRegistry::new(id(0), 0);
        reg.peer_connected(id(1), None);
        // Window is zero, so any silence disqualifies the peer. last_seen
        // equals "now" though, so force it backwards.
        reg.peers.write().get_mut(&id(1)).unwrap().last_seen = 1;

        reg.prune_silent();
        assert_eq!(reg.connected_count(), 0);
        assert_eq!(reg.known_peers(10).len(), 1);
    }
}
