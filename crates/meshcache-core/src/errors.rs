//! Unified error type for the cache layer.
//!
//! The cache prefers "serve nothing and let the caller re-fetch" over
//! surfacing internal failures, so most variants here are logged at the
//! point of degradation rather than returned to callers. The ones that do
//! escape (`Invalid`) mark API misuse and fail fast.

use serde::{Deserialize, Serialize};

/// Unified error type for all cache operations
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum CacheError {
    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// What was wrong with the input
        message: String,
    },

    /// Storage operation failed (disk write, corrupt file)
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure
        message: String,
    },

    /// Network or transport error
    #[error("Network error: {message}")]
    Network {
        /// Description of the network issue
        message: String,
    },

    /// Cryptographic operation failed
    #[error("Crypto error: {message}")]
    Crypto {
        /// Description of the cryptographic failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure
        message: String,
    },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error
        message: String,
    },
}

impl CacheError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Standard result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
