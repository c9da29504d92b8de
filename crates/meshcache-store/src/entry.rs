//! Cache entry records.

use meshcache_core::PeerId;
use serde::{Deserialize, Serialize};

/// Where an entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySource {
    /// Written by a local caller.
    Local,
    /// Received from a mesh peer.
    Peer {
        /// Peer that served the entry.
        origin: PeerId,
    },
}

/// A single cached value with its freshness metadata.
///
/// `validation_hash`, when present, is a digest of caller-chosen freshness
/// fields taken at write time. The store never recomputes or compares it;
/// only the caller can observe the live fields it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Namespace isolating unrelated cache domains.
    pub namespace: String,
    /// Key within the namespace.
    pub key: String,
    /// Caller-serialized payload, opaque to the store.
    pub value: serde_json::Value,
    /// Unix seconds at write time.
    pub created_at: u64,
    /// Lifetime in seconds from `created_at`.
    pub ttl_seconds: u64,
    /// Digest of caller-supplied validation fields at write time.
    pub validation_hash: Option<String>,
    /// Local write or peer propagation.
    pub source: EntrySource,
}

impl CacheEntry {
    /// Create a locally written entry stamped `created_at = now`.
    pub fn local(
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
        ttl_seconds: u64,
        validation_hash: Option<String>,
        now: u64,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            value,
            created_at: now,
            ttl_seconds,
            validation_hash,
            source: EntrySource::Local,
        }
    }

    /// Instant after which the entry must never be served.
    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.ttl_seconds)
    }

    /// Whether the entry is past its TTL at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Seconds of TTL left at `now`, zero when expired.
    pub fn ttl_remaining(&self, now: u64) -> u64 {
        self.expires_at().saturating_sub(now)
    }
}
