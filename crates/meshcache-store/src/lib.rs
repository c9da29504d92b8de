//! The generic TTL cache store.
//!
//! [`CacheStore`] owns entry lifecycle exclusively: creation on `put`,
//! lazy eviction on access, periodic sweeps, and best-effort JSON
//! persistence. Peer propagation is bridged through the [`EntryAnnouncer`]
//! and [`PeerBridge`] seams so this crate stays free of networking.

pub mod entry;
pub mod persist;
pub mod stats;
pub mod store;

pub use entry::{CacheEntry, EntrySource};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{AnnounceInfo, CacheStore, EntryAnnouncer, FetchedEntry, PeerBridge};
