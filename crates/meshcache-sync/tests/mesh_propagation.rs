//! Two-node propagation over loopback.

use meshcache_core::{CacheConfig, PeerId};
use meshcache_peers::{PeerIdentity, PeerRegistry};
use meshcache_store::CacheStore;
use meshcache_sync::SyncService;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    store: Arc<CacheStore>,
    registry: Arc<PeerRegistry>,
    service: Arc<SyncService>,
}

fn init_tracing() {
    // Several tests race to install the subscriber; losing is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_node(bootstrap: Vec<String>, secret: Option<&str>) -> Node {
    init_tracing();
    let config = CacheConfig {
        enable_persistence: false,
        enable_p2p: true,
        p2p_listen_port: 0,
        p2p_bootstrap_peers: bootstrap,
        shared_secret: secret.map(str::to_string),
        ..CacheConfig::default()
    };
    let identity = PeerIdentity::generate();
    let store = CacheStore::new(&config).unwrap();
    let registry = Arc::new(PeerRegistry::new(
        identity.peer_id(),
        config.peer_silence_window_secs,
    ));
    let service = SyncService::start(&config, &identity, Arc::clone(&store), Arc::clone(&registry))
        .await
        .unwrap();
    store.start_background();
    Node {
        store,
        registry,
        service,
    }
}

fn addr_of(node: &Node) -> String {
    format!("127.0.0.1:{}", node.service.local_port().unwrap())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn announce_propagates_an_entry_to_peers() {
    let a = start_node(Vec::new(), None).await;
    let b = start_node(vec![addr_of(&a)], None).await;
    settle().await;

    // Bootstrap made the nodes mutually known.
    assert_eq!(a.registry.connected_count(), 1);
    assert_eq!(b.registry.connected_count(), 1);

    a.store
        .put(
            "repos",
            "octocat/Hello-World",
            json!({"stars": 80}),
            Some(600),
            Some("sha256:v1".to_string()),
        )
        .unwrap();

    // Announce -> fetch -> adopt is asynchronous; poll briefly.
    let mut adopted = None;
    for _ in 0..20 {
        settle().await;
        adopted = b.store.get("repos", "octocat/Hello-World");
        if adopted.is_some() {
            break;
        }
    }
    let (value, hash) = adopted.expect("entry never propagated");
    assert_eq!(value, json!({"stars": 80}));
    assert_eq!(hash.as_deref(), Some("sha256:v1"));

    a.service.stop();
    b.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn miss_falls_through_to_a_connected_peer() {
    let a = start_node(Vec::new(), None).await;

    // Seed A before B exists, so nothing is announced to B.
    a.store
        .put("repos", "org/quiet", json!({"stars": 3}), Some(600), None)
        .unwrap();

    let b = start_node(vec![addr_of(&a)], None).await;
    settle().await;

    let (value, _) = b
        .store
        .get_or_fetch("repos", "org/quiet")
        .await
        .expect("peer fetch failed");
    assert_eq!(value, json!({"stars": 3}));
    assert_eq!(b.store.stats().peer_hits, 1);

    // The fetched entry is now served locally.
    assert!(b.store.get("repos", "org/quiet").is_some());

    a.service.stop();
    b.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_mesh_propagates_between_secret_holders() {
    let a = start_node(Vec::new(), Some("ghp_shared")).await;
    let b = start_node(vec![addr_of(&a)], Some("ghp_shared")).await;
    settle().await;

    a.store
        .put("repos", "sealed/entry", json!(1), Some(600), None)
        .unwrap();

    let mut found = None;
    for _ in 0..20 {
        settle().await;
        found = b.store.get("repos", "sealed/entry");
        if found.is_some() {
            break;
        }
    }
    assert!(found.is_some());

    a.service.stop();
    b.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_secret_peers_never_join_the_mesh() {
    let a = start_node(Vec::new(), Some("token-a")).await;
    let b = start_node(vec![addr_of(&a)], Some("token-b")).await;
    settle().await;

    assert_eq!(a.registry.connected_count(), 0);
    assert_eq!(b.registry.connected_count(), 0);

    a.service.stop();
    b.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_round_trip_does_not_demote_the_peer() {
    let a = start_node(Vec::new(), None).await;

    // A connected peer whose address went dark.
    a.registry
        .peer_connected(PeerId::from_bytes([7; 32]), Some("127.0.0.1:1".to_string()));
    assert_eq!(a.registry.connected_count(), 1);

    // The fetch and the announce both fail against the dead address, but
    // liveness is the silence sweep's call, not one failed dial.
    assert!(a.store.get_or_fetch("repos", "missing").await.is_none());
    a.store
        .put("repos", "fresh", json!(1), Some(600), None)
        .unwrap();
    settle().await;

    assert_eq!(a.registry.connected_count(), 1);
    a.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn one_hop_discovery_is_capped_and_deduplicated() {
    // Hub knows two leaves; a newcomer bootstrapping off the hub learns
    // about them in one hop.
    let hub = start_node(Vec::new(), None).await;
    let _leaf_a = start_node(vec![addr_of(&hub)], None).await;
    let _leaf_b = start_node(vec![addr_of(&hub)], None).await;
    settle().await;

    let newcomer = start_node(vec![addr_of(&hub)], None).await;
    settle().await;

    let discovered = newcomer.service.discover_peers(2).await;
    assert!(discovered.len() <= 2);
    let mut ids: Vec<_> = discovered.iter().map(|p| p.peer_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), discovered.len());

    let all = newcomer.service.discover_peers(16).await;
    // Hub plus both leaves.
    assert!(all.len() >= 3, "expected 3+ known peers, got {}", all.len());

    hub.service.stop();
    newcomer.service.stop();
}
