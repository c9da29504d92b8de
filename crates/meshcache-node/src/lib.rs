//! The assembled cache node.
//!
//! [`MeshCache`] is an explicitly constructed, explicitly passed instance:
//! tests can run several isolated caches in one process because nothing
//! here is global. Construction wires the store, the peer registry, and
//! the sync service from one [`CacheConfig`]; a transport that cannot
//! start degrades the node to a local-only cache instead of failing.

use meshcache_core::{CacheConfig, CacheResult, PeerId};
use meshcache_peers::{PeerIdentity, PeerRegistry};
use meshcache_store::{CacheStore, StatsSnapshot};
use meshcache_sync::SyncService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Store counters extended with the node's P2P state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    /// Store hit/miss counters.
    #[serde(flatten)]
    pub store: StatsSnapshot,
    /// Whether the mesh is actually running (false when degraded).
    pub p2p_enabled: bool,
    /// Currently connected peers.
    pub connected_peers: usize,
    /// This node's peer id, when P2P is running.
    pub peer_id: Option<String>,
}

/// A cache instance: local store plus optional mesh.
pub struct MeshCache {
    store: Arc<CacheStore>,
    registry: Option<Arc<PeerRegistry>>,
    service: Option<Arc<SyncService>>,
}

impl MeshCache {
    /// Construct a node from configuration.
    ///
    /// P2P failures (unbindable port, encryption required but keyless)
    /// are logged and leave a working local-only cache; only invalid
    /// configuration is an error.
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;

        let store = CacheStore::new(&config)?;
        store.start_background();

        let (registry, service) = if config.enable_p2p {
            let identity = if config.enable_persistence {
                match PeerIdentity::load_or_generate(&config.resolved_cache_dir()) {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!(error = %e, "Identity not persistable, using ephemeral identity");
                        PeerIdentity::generate()
                    }
                }
            } else {
                PeerIdentity::generate()
            };

            let registry = Arc::new(PeerRegistry::new(
                identity.peer_id(),
                config.peer_silence_window_secs,
            ));
            let service = match SyncService::start(
                &config,
                &identity,
                Arc::clone(&store),
                Arc::clone(&registry),
            )
            .await
            {
                Ok(service) => Some(service),
                Err(e) => {
                    warn!(error = %e, "P2P unavailable, continuing as local-only cache");
                    None
                }
            };
            (Some(registry), service)
        } else {
            (None, None)
        };

        Ok(Self {
            store,
            registry,
            service,
        })
    }

    /// Look up locally.
    pub fn get(&self, namespace: &str, key: &str) -> Option<(serde_json::Value, Option<String>)> {
        self.store.get(namespace, key)
    }

    /// Look up locally, then via connected peers with a bounded deadline.
    pub async fn get_or_fetch(
        &self,
        namespace: &str,
        key: &str,
    ) -> Option<(serde_json::Value, Option<String>)> {
        self.store.get_or_fetch(namespace, key).await
    }

    /// Write an entry; persistence and announcement happen in the
    /// background.
    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: Option<u64>,
        validation_hash: Option<String>,
    ) -> CacheResult<()> {
        self.store.put(namespace, key, value, ttl_seconds, validation_hash)
    }

    /// Remove one entry.
    pub fn invalidate(&self, namespace: &str, key: &str) {
        self.store.invalidate(namespace, key);
    }

    /// Remove entries whose key contains `pattern`; returns the count.
    pub fn invalidate_pattern(&self, namespace: &str, pattern: &str) -> usize {
        self.store.invalidate_pattern(namespace, pattern)
    }

    /// The underlying generic store, for policy layers built on top.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// This node's peer id, when the mesh is running.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.service.as_ref().map(|s| s.peer_id())
    }

    /// Counters plus P2P state.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            store: self.store.stats(),
            p2p_enabled: self.service.is_some(),
            connected_peers: self
                .registry
                .as_ref()
                .map(|r| r.connected_count())
                .unwrap_or(0),
            peer_id: self.peer_id().map(|id| id.to_string()),
        }
    }

    /// Stop the mesh and drain background store tasks.
    pub async fn shutdown(&self) {
        if let Some(service) = &self.service {
            service.stop();
        }
        self.store.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_only_node_round_trips() {
        let config = CacheConfig {
            enable_persistence: false,
            ..CacheConfig::default()
        };
        let node = MeshCache::new(config).await.unwrap();

        node.put("repos", "a", json!({"stars": 1}), None, None).unwrap();
        assert_eq!(node.get("repos", "a").unwrap().0, json!({"stars": 1}));

        let stats = node.stats();
        assert!(!stats.p2p_enabled);
        assert_eq!(stats.peer_id, None);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let config = CacheConfig {
            default_ttl: 0,
            ..CacheConfig::default()
        };
        assert!(MeshCache::new(config).await.is_err());
    }
}
