//! The cache store: in-memory maps, TTL enforcement, background jobs.

use crate::entry::{CacheEntry, EntrySource};
use crate::persist;
use crate::stats::{CacheStats, StatsSnapshot};
use async_trait::async_trait;
use meshcache_core::{time, CacheConfig, CacheError, CacheResult, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lightweight description of a fresh local write, handed to the sync
/// layer so peers can decide whether to fetch.
#[derive(Debug, Clone)]
pub struct AnnounceInfo {
    /// Namespace of the written entry.
    pub namespace: String,
    /// Key of the written entry.
    pub key: String,
    /// Validation digest at write time, if any.
    pub validation_hash: Option<String>,
    /// Seconds of TTL left at announcement time.
    pub ttl_remaining: u64,
}

/// Seam through which `put` announces fresh writes to the mesh.
///
/// Implementations must be fire-and-forget: `announce` is called from the
/// background worker and must never block on network I/O.
pub trait EntryAnnouncer: Send + Sync {
    /// Queue an announcement for delivery to connected peers.
    fn announce(&self, info: AnnounceInfo);
}

/// Entry material returned by a successful peer fetch.
#[derive(Debug, Clone)]
pub struct FetchedEntry {
    /// Payload from the peer.
    pub value: serde_json::Value,
    /// Seconds of TTL the peer reported remaining.
    pub ttl_remaining: u64,
    /// Validation digest the peer stored, if any.
    pub validation_hash: Option<String>,
    /// Peer that served the entry.
    pub origin: PeerId,
}

/// Seam through which a local miss may be satisfied by the mesh.
#[async_trait]
pub trait PeerBridge: Send + Sync {
    /// Ask connected peers for an entry. Best-effort; `None` on failure.
    async fn fetch(&self, namespace: &str, key: &str) -> Option<FetchedEntry>;
}

/// Jobs handled by the background worker.
enum StoreJob {
    Persist { namespace: String },
    Announce(AnnounceInfo),
}

/// The generic TTL cache.
///
/// `get`/`put`/`invalidate` are synchronous and safe under concurrent
/// callers; the expensive work on a miss (the remote API call) happens
/// outside the lock, in the caller. Persistence and peer announcements are
/// dispatched to a background worker so `put` returns immediately after
/// the in-memory write.
pub struct CacheStore {
    default_ttl: u64,
    max_cache_size: usize,
    peer_fetch_timeout: Duration,
    /// `None` when persistence is disabled or degraded to memory-only.
    persist_dir: Option<PathBuf>,
    /// namespace -> key -> entry
    entries: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    stats: CacheStats,
    jobs: Mutex<Option<mpsc::UnboundedSender<StoreJob>>>,
    announcer: Mutex<Option<Arc<dyn EntryAnnouncer>>>,
    bridge: Mutex<Option<Arc<dyn PeerBridge>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweep_interval: Option<Duration>,
}

impl CacheStore {
    /// Build a store from configuration, loading any persisted namespaces.
    ///
    /// An unusable cache directory is reported once here and the store
    /// proceeds memory-only; it never fails construction for that.
    pub fn new(config: &CacheConfig) -> CacheResult<Arc<Self>> {
        config.validate()?;

        let persist_dir = if config.enable_persistence {
            let dir = config.resolved_cache_dir();
            match std::fs::create_dir_all(&dir) {
                Ok(()) => Some(dir),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Cache directory unusable, running memory-only");
                    None
                }
            }
        } else {
            None
        };

        let mut entries: HashMap<String, HashMap<String, CacheEntry>> = HashMap::new();
        if let Some(dir) = &persist_dir {
            let now = time::now_seconds();
            for namespace in persist::list_namespaces(dir) {
                let loaded = persist::load_namespace(dir, &namespace, now);
                if loaded.is_empty() {
                    continue;
                }
                debug!(namespace = %namespace, count = loaded.len(), "Loaded persisted namespace");
                entries.insert(
                    namespace,
                    loaded.into_iter().map(|e| (e.key.clone(), e)).collect(),
                );
            }
        }

        Ok(Arc::new(Self {
            default_ttl: config.default_ttl,
            max_cache_size: config.max_cache_size,
            peer_fetch_timeout: Duration::from_millis(config.peer_fetch_timeout_ms),
            persist_dir,
            entries: RwLock::new(entries),
            stats: CacheStats::default(),
            jobs: Mutex::new(None),
            announcer: Mutex::new(None),
            bridge: Mutex::new(None),
            worker: Mutex::new(None),
            sweeper: Mutex::new(None),
            sweep_interval: config.sweep_interval_secs.map(Duration::from_secs),
        }))
    }

    /// Attach the announcer used for propagating local writes.
    pub fn set_announcer(&self, announcer: Arc<dyn EntryAnnouncer>) {
        *self.announcer.lock() = Some(announcer);
    }

    /// Attach the bridge used to satisfy misses from the mesh.
    pub fn set_peer_bridge(&self, bridge: Arc<dyn PeerBridge>) {
        *self.bridge.lock() = Some(bridge);
    }

    /// Spawn the background worker (and the sweep loop when configured).
    ///
    /// Must run inside a tokio runtime. Without a running worker, `put`
    /// falls back to persisting inline, so purely synchronous callers keep
    /// working.
    pub fn start_background(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.jobs.lock() = Some(tx);

        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    StoreJob::Persist { namespace } => store.persist_namespace(&namespace),
                    StoreJob::Announce(info) => {
                        let announcer = store.announcer.lock().clone();
                        if let Some(announcer) = announcer {
                            announcer.announce(info);
                        }
                    }
                }
            }
        });
        *self.worker.lock() = Some(handle);

        if let Some(interval) = self.sweep_interval {
            let store = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    store.sweep();
                }
            });
            *self.sweeper.lock() = Some(handle);
        }
    }

    /// Stop background tasks, draining queued persist/announce jobs.
    pub async fn shutdown(&self) {
        // Dropping the sender lets the worker drain the queue and exit.
        self.jobs.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }

    /// Look up an entry. `None` when absent or expired; expired entries
    /// encountered here are removed.
    pub fn get(&self, namespace: &str, key: &str) -> Option<(serde_json::Value, Option<String>)> {
        enum Lookup {
            Miss,
            Expired,
            Hit(serde_json::Value, Option<String>),
        }

        let now = time::now_seconds();
        // The write guard must be released before scheduling: without a
        // worker, schedule persists inline and retakes the entries lock.
        let outcome = {
            let mut entries = self.entries.write();
            match entries.get_mut(namespace) {
                None => Lookup::Miss,
                Some(ns) => match ns.get(key) {
                    None => Lookup::Miss,
                    Some(entry) if entry.is_expired(now) => {
                        ns.remove(key);
                        Lookup::Expired
                    }
                    Some(entry) => {
                        Lookup::Hit(entry.value.clone(), entry.validation_hash.clone())
                    }
                },
            }
        };

        match outcome {
            Lookup::Miss => {
                self.stats.record_miss();
                None
            }
            Lookup::Expired => {
                self.stats.record_expiration();
                self.stats.record_miss();
                self.schedule(StoreJob::Persist {
                    namespace: namespace.to_string(),
                });
                None
            }
            Lookup::Hit(value, validation_hash) => {
                self.stats.record_hit(value.to_string().len() as u64);
                Some((value, validation_hash))
            }
        }
    }

    /// Look up locally, then fall through to connected peers with a
    /// bounded deadline. The caller is never made to wait on the mesh
    /// beyond the configured timeout.
    pub async fn get_or_fetch(
        &self,
        namespace: &str,
        key: &str,
    ) -> Option<(serde_json::Value, Option<String>)> {
        if let Some(found) = self.get(namespace, key) {
            return Some(found);
        }

        let bridge = self.bridge.lock().clone()?;
        let fetched =
            match tokio::time::timeout(self.peer_fetch_timeout, bridge.fetch(namespace, key)).await
            {
                Ok(Some(fetched)) if fetched.ttl_remaining > 0 => fetched,
                Ok(_) => return None,
                Err(_) => {
                    debug!(namespace, key, "Peer fetch timed out, declaring miss");
                    return None;
                }
            };

        let value = fetched.value.clone();
        let validation_hash = fetched.validation_hash.clone();
        self.stats.record_peer_hit(value.to_string().len() as u64);

        self.insert_entry(CacheEntry {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: fetched.value,
            created_at: time::now_seconds(),
            ttl_seconds: fetched.ttl_remaining,
            validation_hash: fetched.validation_hash,
            source: EntrySource::Peer {
                origin: fetched.origin,
            },
        });
        Some((value, validation_hash))
    }

    /// Write an entry, overwriting any existing one.
    ///
    /// Returns immediately after the in-memory write; persistence and the
    /// peer announcement run on the background worker. A zero TTL is API
    /// misuse and fails fast.
    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: Option<u64>,
        validation_hash: Option<String>,
    ) -> CacheResult<()> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        if ttl == 0 {
            return Err(CacheError::invalid("ttl_seconds must be positive"));
        }

        let now = time::now_seconds();
        let entry = CacheEntry::local(namespace, key, value, ttl, validation_hash.clone(), now);

        {
            let mut entries = self.entries.write();
            entries
                .entry(namespace.to_string())
                .or_default()
                .insert(key.to_string(), entry);
        }
        self.enforce_capacity();

        self.schedule(StoreJob::Persist {
            namespace: namespace.to_string(),
        });
        self.schedule(StoreJob::Announce(AnnounceInfo {
            namespace: namespace.to_string(),
            key: key.to_string(),
            validation_hash,
            ttl_remaining: ttl,
        }));
        Ok(())
    }

    /// Insert a fully formed entry without announcing it. Used for
    /// peer-sourced entries (re-announcing would echo gossip forever) and
    /// by tests that need back-dated `created_at` values.
    pub fn insert_entry(&self, entry: CacheEntry) {
        let namespace = entry.namespace.clone();
        {
            let mut entries = self.entries.write();
            entries
                .entry(namespace.clone())
                .or_default()
                .insert(entry.key.clone(), entry);
        }
        self.enforce_capacity();
        self.schedule(StoreJob::Persist { namespace });
    }

    /// Remove one entry.
    pub fn invalidate(&self, namespace: &str, key: &str) {
        let removed = {
            let mut entries = self.entries.write();
            entries
                .get_mut(namespace)
                .map(|ns| ns.remove(key).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.schedule(StoreJob::Persist {
                namespace: namespace.to_string(),
            });
        }
    }

    /// Remove all entries in a namespace whose key contains `pattern`.
    /// Returns how many were removed.
    pub fn invalidate_pattern(&self, namespace: &str, pattern: &str) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            let Some(ns) = entries.get_mut(namespace) else {
                return 0;
            };
            let before = ns.len();
            ns.retain(|key, _| !key.contains(pattern));
            before - ns.len()
        };
        if removed > 0 {
            self.schedule(StoreJob::Persist {
                namespace: namespace.to_string(),
            });
        }
        removed
    }

    /// Drop every entry and reset counters.
    pub fn clear(&self) {
        let namespaces: Vec<String> = {
            let mut entries = self.entries.write();
            let namespaces = entries.keys().cloned().collect();
            entries.clear();
            namespaces
        };
        self.stats.clear();
        for namespace in namespaces {
            self.schedule(StoreJob::Persist { namespace });
        }
    }

    /// Snapshot the hit/miss counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Total live entries across namespaces.
    pub fn entry_count(&self) -> usize {
        self.entries.read().values().map(|ns| ns.len()).sum()
    }

    /// Serve a peer's FETCH without touching the local hit/miss counters.
    pub fn lookup_for_peer(
        &self,
        namespace: &str,
        key: &str,
    ) -> Option<(serde_json::Value, u64, Option<String>)> {
        let now = time::now_seconds();
        let entries = self.entries.read();
        let entry = entries.get(namespace)?.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some((
            entry.value.clone(),
            entry.ttl_remaining(now),
            entry.validation_hash.clone(),
        ))
    }

    /// The stored validation hash for an entry: `None` when the entry is
    /// absent, `Some(hash)` otherwise. Lets the sync layer decide whether
    /// an ANNOUNCE warrants a fetch.
    pub fn validation_state(&self, namespace: &str, key: &str) -> Option<Option<String>> {
        let now = time::now_seconds();
        let entries = self.entries.read();
        let entry = entries.get(namespace)?.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.validation_hash.clone())
    }

    /// Evict expired entries and enforce the entry-count cap.
    pub fn sweep(&self) {
        let now = time::now_seconds();
        let mut dirty = Vec::new();
        {
            let mut entries = self.entries.write();
            for (namespace, ns) in entries.iter_mut() {
                let before = ns.len();
                ns.retain(|_, entry| !entry.is_expired(now));
                let expired = before - ns.len();
                if expired > 0 {
                    for _ in 0..expired {
                        self.stats.record_expiration();
                    }
                    dirty.push(namespace.clone());
                }
            }
        }
        self.enforce_capacity();
        for namespace in dirty {
            self.schedule(StoreJob::Persist { namespace });
        }
    }

    /// Evict earliest-expiring entries while over `max_cache_size`.
    fn enforce_capacity(&self) {
        let mut entries = self.entries.write();
        let total: usize = entries.values().map(|ns| ns.len()).sum();
        if total <= self.max_cache_size {
            return;
        }

        let mut expiry_order: Vec<(u64, String, String)> = entries
            .iter()
            .flat_map(|(namespace, ns)| {
                ns.values()
                    .map(|e| (e.expires_at(), namespace.clone(), e.key.clone()))
            })
            .collect();
        expiry_order.sort();

        let excess = total - self.max_cache_size;
        for (_, namespace, key) in expiry_order.into_iter().take(excess) {
            if let Some(ns) = entries.get_mut(&namespace) {
                ns.remove(&key);
            }
        }
        debug!(evicted = excess, cap = self.max_cache_size, "Capacity eviction");
    }

    /// Persist one namespace, degrading silently on failure.
    fn persist_namespace(&self, namespace: &str) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let snapshot: Vec<CacheEntry> = {
            let entries = self.entries.read();
            entries
                .get(namespace)
                .map(|ns| ns.values().cloned().collect())
                .unwrap_or_default()
        };
        if let Err(e) = persist::save_namespace(dir, namespace, &snapshot) {
            warn!(namespace, error = %e, "Persistence failed for this write");
        }
    }

    /// Hand a job to the background worker, or run it inline when no
    /// worker is running.
    fn schedule(&self, job: StoreJob) {
        let sender = self.jobs.lock().clone();
        match sender {
            Some(tx) => {
                if tx.send(job).is_err() {
                    // Worker already shut down; nothing left to do.
                }
            }
            None => match job {
                StoreJob::Persist { namespace } => self.persist_namespace(&namespace),
                StoreJob::Announce(info) => {
                    let announcer = self.announcer.lock().clone();
                    if let Some(announcer) = announcer {
                        announcer.announce(info);
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_store() -> Arc<CacheStore> {
        let config = CacheConfig {
            enable_persistence: false,
            ..CacheConfig::default()
        };
        CacheStore::new(&config).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = memory_store();
        store
            .put("repos", "octocat/Hello-World", json!({"stars": 80}), Some(600), None)
            .unwrap();

        let (value, hash) = store.get("repos", "octocat/Hello-World").unwrap();
        assert_eq!(value, json!({"stars": 80}));
        assert_eq!(hash, None);

        let snap = store.stats();
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 0);
    }

    #[test]
    fn expired_entry_is_a_miss_and_counts_once() {
        let store = memory_store();
        // Back-date the entry so its 600s TTL has already elapsed.
        let created = time::now_seconds() - 601;
        store.insert_entry(CacheEntry::local(
            "repos",
            "octocat/Hello-World",
            json!({"stars": 80}),
            600,
            None,
            created,
        ));

        assert!(store.get("repos", "octocat/Hello-World").is_none());
        let snap = store.stats();
        assert_eq!(snap.expirations, 1);
        assert_eq!(snap.misses, 1);

        // Entry was lazily removed; a second access is a plain miss.
        assert!(store.get("repos", "octocat/Hello-World").is_none());
        assert_eq!(store.stats().expirations, 1);
    }

    #[test]
    fn zero_ttl_fails_fast() {
        let store = memory_store();
        let result = store.put("repos", "a", json!(1), Some(0), None);
        assert!(matches!(result, Err(CacheError::Invalid { .. })));
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = memory_store();
        store.put("codeql", "a", json!("scan"), None, None).unwrap();
        store.put("repos", "a", json!("repo"), None, None).unwrap();

        assert_eq!(store.get("codeql", "a").unwrap().0, json!("scan"));
        assert_eq!(store.get("repos", "a").unwrap().0, json!("repo"));
        store.invalidate("codeql", "a");
        assert!(store.get("codeql", "a").is_none());
        assert!(store.get("repos", "a").is_some());
    }

    #[test]
    fn invalidate_pattern_counts_matches() {
        let store = memory_store();
        store.put("repos", "octocat/a", json!(1), None, None).unwrap();
        store.put("repos", "octocat/b", json!(2), None, None).unwrap();
        store.put("repos", "other/c", json!(3), None, None).unwrap();

        assert_eq!(store.invalidate_pattern("repos", "octocat/"), 2);
        assert_eq!(store.entry_count(), 1);
        assert_eq!(store.invalidate_pattern("repos", "nothing"), 0);
    }

    #[test]
    fn capacity_evicts_earliest_expiry_first() {
        let config = CacheConfig {
            enable_persistence: false,
            max_cache_size: 2,
            ..CacheConfig::default()
        };
        let store = CacheStore::new(&config).unwrap();
        store.put("ns", "short", json!(1), Some(10), None).unwrap();
        store.put("ns", "medium", json!(2), Some(1000), None).unwrap();
        store.put("ns", "long", json!(3), Some(100_000), None).unwrap();

        assert_eq!(store.entry_count(), 2);
        assert!(store.get("ns", "short").is_none());
        assert!(store.get("ns", "long").is_some());
    }

    #[test]
    fn lookup_for_peer_reports_remaining_ttl() {
        let store = memory_store();
        store.put("repos", "a", json!(1), Some(600), None).unwrap();
        let (_, ttl_remaining, _) = store.lookup_for_peer("repos", "a").unwrap();
        assert!(ttl_remaining > 0 && ttl_remaining <= 600);
        // Serving a peer never touches local counters.
        assert_eq!(store.stats().hits, 0);
    }

    #[tokio::test]
    async fn peer_fetch_times_out_to_a_miss() {
        struct StallingBridge;
        #[async_trait]
        impl PeerBridge for StallingBridge {
            async fn fetch(&self, _namespace: &str, _key: &str) -> Option<FetchedEntry> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                None
            }
        }

        let config = CacheConfig {
            enable_persistence: false,
            peer_fetch_timeout_ms: 20,
            ..CacheConfig::default()
        };
        let store = CacheStore::new(&config).unwrap();
        store.set_peer_bridge(Arc::new(StallingBridge));

        let started = std::time::Instant::now();
        assert!(store.get_or_fetch("repos", "missing").await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn peer_fetch_populates_the_store() {
        struct OneEntryBridge;
        #[async_trait]
        impl PeerBridge for OneEntryBridge {
            async fn fetch(&self, namespace: &str, key: &str) -> Option<FetchedEntry> {
                (namespace == "repos" && key == "hit").then(|| FetchedEntry {
                    value: json!({"from": "peer"}),
                    ttl_remaining: 120,
                    validation_hash: Some("sha256:ab".to_string()),
                    origin: PeerId::from_bytes([9u8; 32]),
                })
            }
        }

        let store = memory_store();
        store.set_peer_bridge(Arc::new(OneEntryBridge));

        let (value, hash) = store.get_or_fetch("repos", "hit").await.unwrap();
        assert_eq!(value, json!({"from": "peer"}));
        assert_eq!(hash.as_deref(), Some("sha256:ab"));
        assert_eq!(store.stats().peer_hits, 1);

        // Second lookup is a plain local hit.
        assert!(store.get("repos", "hit").is_some());
    }

    #[tokio::test]
    async fn background_worker_drains_on_shutdown() {
        struct Recording(Mutex<Vec<String>>);
        impl EntryAnnouncer for Recording {
            fn announce(&self, info: AnnounceInfo) {
                self.0.lock().push(info.key);
            }
        }

        let store = memory_store();
        let recorder = Arc::new(Recording(Mutex::new(Vec::new())));
        store.set_announcer(recorder.clone());
        store.start_background();

        store.put("repos", "a", json!(1), None, None).unwrap();
        store.put("repos", "b", json!(2), None, None).unwrap();
        store.shutdown().await;

        let seen = recorder.0.lock().clone();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }
}
