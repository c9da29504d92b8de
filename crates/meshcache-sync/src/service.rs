//! The sync service: bridges the store and the mesh.
//!
//! Implements the store's announce/fetch seams on top of the transport,
//! answers inbound protocol messages, and runs the gossip-based discovery
//! loop. All of it is best-effort: a peer that cannot be reached is marked
//! disconnected and skipped, never waited on.

use crate::cipher::FrameCipher;
use crate::transport::{MessageHandler, TcpTransport};
use crate::wire::SyncPayload;
use async_trait::async_trait;
use meshcache_core::{CacheConfig, CacheError, CacheResult, PeerId};
use meshcache_peers::{PeerIdentity, PeerRecord, PeerRegistry, RegistryState};
use meshcache_store::{
    AnnounceInfo, CacheEntry, CacheStore, EntryAnnouncer, EntrySource, FetchedEntry, PeerBridge,
};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the discovery loop gossips and prunes.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Cap on peers exchanged per gossip message.
const MAX_GOSSIP_PEERS: usize = 32;

/// Disconnected candidates dialed per discovery round.
const DIAL_CANDIDATES_PER_ROUND: usize = 3;

/// Fire-and-forget announcer handed to the store. Holds only the queue
/// sender, so the store never points back at the service.
struct MeshAnnouncer {
    tx: mpsc::UnboundedSender<AnnounceInfo>,
}

impl EntryAnnouncer for MeshAnnouncer {
    fn announce(&self, info: AnnounceInfo) {
        // A closed queue means the mesh is shutting down; drop silently.
        let _ = self.tx.send(info);
    }
}

/// Miss-path bridge handed to the store.
struct MeshBridge {
    transport: Arc<TcpTransport>,
    registry: Arc<PeerRegistry>,
}

#[async_trait]
impl PeerBridge for MeshBridge {
    async fn fetch(&self, namespace: &str, key: &str) -> Option<FetchedEntry> {
        for peer in self.registry.connected_peers() {
            let Some(addr) = peer.addresses.iter().next().cloned() else {
                continue;
            };
            let request = SyncPayload::Fetch {
                namespace: namespace.to_string(),
                key: key.to_string(),
            };
            match self.transport.request(&addr, request).await {
                Ok(envelope) => {
                    self.registry.mark_seen(envelope.from);
                    if let SyncPayload::FetchReply {
                        found: true,
                        value: Some(value),
                        ttl_remaining,
                        validation_hash,
                        ..
                    } = envelope.payload
                    {
                        return Some(FetchedEntry {
                            value,
                            ttl_remaining,
                            validation_hash,
                            origin: envelope.from,
                        });
                    }
                }
                Err(e) => {
                    // One failed round-trip is not a liveness verdict;
                    // the silence sweep demotes peers that stay quiet.
                    debug!(peer = %peer.peer_id.short(), error = %e, "Peer fetch failed");
                }
            }
        }
        None
    }
}

/// Moves cache entries between this node and its peers.
pub struct SyncService {
    local_id: PeerId,
    store: Arc<CacheStore>,
    registry: Arc<PeerRegistry>,
    transport: Arc<TcpTransport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    /// Build the service, bind the transport, and start background loops.
    ///
    /// Errors here (encryption required but unavailable, listen address
    /// unbindable) put the registry in `Disabled` so the caller can keep
    /// running a local-only cache.
    pub async fn start(
        config: &CacheConfig,
        identity: &PeerIdentity,
        store: Arc<CacheStore>,
        registry: Arc<PeerRegistry>,
    ) -> CacheResult<Arc<Self>> {
        let cipher = match FrameCipher::from_config(
            config.shared_secret.as_deref(),
            config.require_encryption,
        ) {
            Ok(Some(cipher)) => cipher,
            Ok(None) => {
                registry.set_state(RegistryState::Disabled);
                return Err(CacheError::crypto(
                    "Encryption required but no shared secret configured",
                ));
            }
            Err(e) => {
                registry.set_state(RegistryState::Disabled);
                return Err(e);
            }
        };

        let io_timeout = Duration::from_millis(config.peer_fetch_timeout_ms);
        let transport = Arc::new(TcpTransport::new(identity.peer_id(), cipher, io_timeout));

        let service = Arc::new(Self {
            local_id: identity.peer_id(),
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            transport: Arc::clone(&transport),
            tasks: Mutex::new(Vec::new()),
        });

        let handler: Arc<dyn MessageHandler> = Arc::clone(&service) as Arc<dyn MessageHandler>;
        if let Err(e) = transport.bind(config.p2p_listen_port, handler).await {
            registry.set_state(RegistryState::Disabled);
            return Err(e);
        }
        registry.set_state(RegistryState::Listening);

        // Announce queue: consumed here, fed by the store's worker.
        let (tx, rx) = mpsc::unbounded_channel();
        store.set_announcer(Arc::new(MeshAnnouncer { tx }));
        store.set_peer_bridge(Arc::new(MeshBridge {
            transport: Arc::clone(&transport),
            registry: Arc::clone(&registry),
        }));

        service.spawn_announce_loop(rx);
        if config.enable_peer_discovery {
            service.spawn_discovery_loop();
        }
        service.spawn_bootstrap(config.p2p_bootstrap_peers.clone());

        info!(peer_id = %identity.peer_id().short(), "Sync service started");
        Ok(service)
    }

    /// The local node's identifier.
    pub fn peer_id(&self) -> PeerId {
        self.local_id
    }

    /// Port the transport listens on.
    pub fn local_port(&self) -> Option<u16> {
        self.transport.local_port()
    }

    /// One-hop discovery: ask currently connected peers for their peer
    /// lists, merge, and return at most `max_peers` known peers. Returns
    /// an empty list rather than an error when nobody is reachable.
    pub async fn discover_peers(&self, max_peers: usize) -> Vec<PeerRecord> {
        for peer in self.registry.connected_peers() {
            let Some(addr) = peer.addresses.iter().next().cloned() else {
                continue;
            };
            match self.transport.request(&addr, SyncPayload::GossipPeersRequest).await {
                Ok(envelope) => {
                    self.registry.mark_seen(envelope.from);
                    if let SyncPayload::GossipPeers { peers } = envelope.payload {
                        self.registry.merge_adverts(&peers);
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.peer_id.short(), error = %e, "Gossip request failed");
                }
            }
        }
        self.registry.known_peers(max_peers)
    }

    /// Stop background loops and the transport.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.stop();
    }

    fn spawn_announce_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<AnnounceInfo>) {
        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(info) = rx.recv().await {
                service.broadcast_announce(info).await;
            }
        });
        self.tasks.lock().push(task);
    }

    /// Push one announcement to every connected peer.
    async fn broadcast_announce(&self, info: AnnounceInfo) {
        for peer in self.registry.connected_peers() {
            let Some(addr) = peer.addresses.iter().next().cloned() else {
                continue;
            };
            let payload = SyncPayload::Announce {
                namespace: info.namespace.clone(),
                key: info.key.clone(),
                validation_hash: info.validation_hash.clone(),
                ttl_remaining: info.ttl_remaining,
            };
            if let Err(e) = self.transport.notify(&addr, payload).await {
                debug!(peer = %peer.peer_id.short(), error = %e, "Announce not delivered");
            }
        }
    }

    fn spawn_discovery_loop(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                service.discover_peers(MAX_GOSSIP_PEERS).await;
                service.dial_candidates().await;
                service.registry.prune_silent();
            }
        });
        self.tasks.lock().push(task);
    }

    /// Try to establish contact with a few disconnected candidates.
    async fn dial_candidates(&self) {
        let candidates: Vec<PeerRecord> = self
            .registry
            .known_peers(MAX_GOSSIP_PEERS)
            .into_iter()
            .filter(|p| !p.connected && !p.addresses.is_empty())
            .take(DIAL_CANDIDATES_PER_ROUND)
            .collect();

        for candidate in candidates {
            let Some(addr) = candidate.addresses.iter().next().cloned() else {
                continue;
            };
            match self.transport.request(&addr, SyncPayload::GossipPeersRequest).await {
                Ok(envelope) => {
                    self.registry.peer_connected(envelope.from, Some(addr));
                    if let SyncPayload::GossipPeers { peers } = envelope.payload {
                        self.registry.merge_adverts(&peers);
                    }
                }
                Err(_) => {
                    // Still unreachable; try again a later round.
                }
            }
        }
    }

    fn spawn_bootstrap(self: &Arc<Self>, seeds: Vec<String>) {
        if seeds.is_empty() {
            return;
        }
        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            for addr in seeds {
                match service
                    .transport
                    .request(&addr, SyncPayload::GossipPeersRequest)
                    .await
                {
                    Ok(envelope) => {
                        service.registry.peer_connected(envelope.from, Some(addr));
                        if let SyncPayload::GossipPeers { peers } = envelope.payload {
                            service.registry.merge_adverts(&peers);
                        }
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "Bootstrap peer unreachable");
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

}

/// Pull an announced entry from the peer that announced it and adopt it
/// locally. Runs detached so the inbound session is never blocked.
async fn fetch_announced(
    store: Arc<CacheStore>,
    registry: Arc<PeerRegistry>,
    transport: Arc<TcpTransport>,
    from: PeerId,
    namespace: String,
    key: String,
) {
    let addr = registry
        .connected_peers()
        .into_iter()
        .find(|p| p.peer_id == from)
        .and_then(|p| p.addresses.iter().next().cloned());
    let Some(addr) = addr else {
        return;
    };

    let request = SyncPayload::Fetch {
        namespace: namespace.clone(),
        key: key.clone(),
    };
    let Ok(envelope) = transport.request(&addr, request).await else {
        return;
    };
    if let SyncPayload::FetchReply {
        found: true,
        value: Some(value),
        ttl_remaining,
        validation_hash,
        ..
    } = envelope.payload
    {
        if ttl_remaining == 0 {
            return;
        }
        debug!(namespace = %namespace, key = %key, peer = %from.short(), "Adopted announced entry");
        store.insert_entry(CacheEntry {
            namespace,
            key,
            value,
            created_at: meshcache_core::time::now_seconds(),
            ttl_seconds: ttl_remaining,
            validation_hash,
            source: EntrySource::Peer { origin: from },
        });
    }
}

#[async_trait]
impl MessageHandler for SyncService {
    async fn handle(
        &self,
        from: PeerId,
        source_ip: IpAddr,
        payload: SyncPayload,
    ) -> Option<SyncPayload> {
        self.registry.mark_seen(from);

        match payload {
            SyncPayload::Hello { listen_port } => {
                let dial_back = (listen_port != 0)
                    .then(|| format!("{}:{}", source_ip, listen_port));
                self.registry.peer_connected(from, dial_back);
                None
            }
            SyncPayload::Announce {
                namespace,
                key,
                validation_hash,
                ..
            } => {
                // Fetch when the entry is unknown or its validation hash
                // differs from ours. A hash we also hold means our copy is
                // as good as the announcer's.
                let wants_fetch = match self.store.validation_state(&namespace, &key) {
                    None => true,
                    Some(local_hash) => local_hash != validation_hash,
                };
                if wants_fetch {
                    let store = Arc::clone(&self.store);
                    let registry = Arc::clone(&self.registry);
                    let transport = Arc::clone(&self.transport);
                    tokio::spawn(async move {
                        fetch_announced(store, registry, transport, from, namespace, key).await;
                    });
                }
                None
            }
            SyncPayload::Fetch { namespace, key } => {
                let reply = match self.store.lookup_for_peer(&namespace, &key) {
                    Some((value, ttl_remaining, validation_hash)) => SyncPayload::FetchReply {
                        namespace,
                        key,
                        found: true,
                        value: Some(value),
                        ttl_remaining,
                        validation_hash,
                    },
                    None => SyncPayload::FetchReply {
                        namespace,
                        key,
                        found: false,
                        value: None,
                        ttl_remaining: 0,
                        validation_hash: None,
                    },
                };
                Some(reply)
            }
            SyncPayload::GossipPeersRequest => Some(SyncPayload::GossipPeers {
                peers: self.registry.adverts(MAX_GOSSIP_PEERS),
            }),
            SyncPayload::GossipPeers { peers } => {
                self.registry.merge_adverts(&peers);
                None
            }
            // Replies are consumed by the request path; unsolicited ones
            // carry nothing we asked for.
            SyncPayload::FetchReply { .. } => None,
        }
    }
}
