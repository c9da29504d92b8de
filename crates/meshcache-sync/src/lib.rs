//! Peer-to-peer propagation of cache entries.
//!
//! This crate moves [`meshcache_store`] entries between nodes and nothing
//! else: it has no opinion about what is "correct" data. Propagation is
//! best-effort and eventually consistent; dropped or reordered messages
//! only cost cache hits, never correctness.

pub mod cipher;
pub mod service;
pub mod transport;
pub mod wire;

pub use cipher::FrameCipher;
pub use service::SyncService;
pub use transport::TcpTransport;
pub use wire::{SyncEnvelope, SyncPayload, WIRE_SCHEMA_VERSION};
