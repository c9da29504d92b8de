//! Construction-time configuration.
//!
//! The configuration is populated once at startup and passed by value into
//! the cache constructor. The core never reads process environment state;
//! whatever populates this struct (CLI parsing, env translation) lives with
//! the embedding application.

use crate::{CacheError, CacheResult};
use std::path::PathBuf;

/// Default TTL applied when callers omit one (10 minutes).
pub const DEFAULT_TTL_SECONDS: u64 = 600;

/// Default bound on how long a `get` may wait for a peer fetch.
pub const DEFAULT_PEER_FETCH_TIMEOUT_MS: u64 = 300;

/// Default soft cap on entries per store before eviction sweeps.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 10_000;

/// Default silence window after which a peer is marked disconnected (10 minutes).
pub const DEFAULT_PEER_SILENCE_WINDOW_SECS: u64 = 600;

/// Configuration for a cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory for persisted cache files. `None` selects the user cache
    /// directory (`<user-cache>/meshcache`).
    pub cache_dir: Option<PathBuf>,
    /// TTL in seconds applied when callers omit one.
    pub default_ttl: u64,
    /// Whether to read/write the on-disk cache files.
    pub enable_persistence: bool,
    /// Whether to start the peer transport at all.
    pub enable_p2p: bool,
    /// Whether to run the gossip-based discovery loop.
    pub enable_peer_discovery: bool,
    /// TCP port the transport binds. 0 lets the OS pick.
    pub p2p_listen_port: u16,
    /// Seed peers dialed at startup (`host:port` strings).
    pub p2p_bootstrap_peers: Vec<String>,
    /// Entry-count soft cap before eviction sweeps.
    pub max_cache_size: usize,
    /// Interval for the periodic eviction sweep. `None` disables it.
    pub sweep_interval_secs: Option<u64>,
    /// Bound on how long a `get` waits for a peer fetch reply.
    pub peer_fetch_timeout_ms: u64,
    /// Shared secret keying message encryption. Typically the remote-API
    /// credential, so only holders of it can usefully join the mesh.
    pub shared_secret: Option<String>,
    /// When true and no shared secret is available, P2P is disabled
    /// entirely instead of falling back to plaintext.
    pub require_encryption: bool,
    /// Seconds of silence before a peer is marked disconnected.
    pub peer_silence_window_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            default_ttl: DEFAULT_TTL_SECONDS,
            enable_persistence: true,
            enable_p2p: false,
            enable_peer_discovery: true,
            p2p_listen_port: 0,
            p2p_bootstrap_peers: Vec::new(),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            sweep_interval_secs: Some(60),
            peer_fetch_timeout_ms: DEFAULT_PEER_FETCH_TIMEOUT_MS,
            shared_secret: None,
            require_encryption: false,
            peer_silence_window_secs: DEFAULT_PEER_SILENCE_WINDOW_SECS,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration, failing fast on nonsensical values.
    pub fn validate(&self) -> CacheResult<()> {
        if self.default_ttl == 0 {
            return Err(CacheError::invalid("default_ttl must be positive"));
        }
        if self.peer_fetch_timeout_ms == 0 {
            return Err(CacheError::invalid("peer_fetch_timeout_ms must be positive"));
        }
        if self.max_cache_size == 0 {
            return Err(CacheError::invalid("max_cache_size must be positive"));
        }
        Ok(())
    }

    /// Resolve the effective cache directory.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("meshcache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let config = CacheConfig {
            default_ttl: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_cache_dir_wins() {
        let config = CacheConfig {
            cache_dir: Some(PathBuf::from("/tmp/mesh-test")),
            ..CacheConfig::default()
        };
        assert_eq!(config.resolved_cache_dir(), PathBuf::from("/tmp/mesh-test"));
    }
}
