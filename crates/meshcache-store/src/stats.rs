//! Advisory hit/miss statistics.
//!
//! Counters are monotonic with relaxed ordering. Exact values are
//! advisory and never feed correctness decisions.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters for one store.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    peer_hits: AtomicU64,
    bytes_served: AtomicU64,
}

impl CacheStats {
    /// Record a local hit serving `bytes` of payload.
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a miss.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry evicted because its TTL elapsed.
    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss satisfied by a peer fetch.
    pub fn record_peer_hit(&self, bytes: u64) {
        self.peer_hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            peer_hits: self.peer_hits.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters. Only called on explicit clear.
    pub fn clear(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.peer_hits.store(0, Ordering::Relaxed);
        self.bytes_served.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Local lookups served from memory.
    pub hits: u64,
    /// Lookups that found nothing servable.
    pub misses: u64,
    /// Entries evicted on access because their TTL elapsed.
    pub expirations: u64,
    /// Misses satisfied by a peer fetch.
    pub peer_hits: u64,
    /// Total payload bytes served to callers.
    pub bytes_served: u64,
}
