//! Persistent node identity.
//!
//! The keypair is generated once on first run and persisted next to the
//! cache files, so the derived peer id never changes across restarts.

use ed25519_dalek::{SigningKey, VerifyingKey};
use meshcache_core::{CacheError, CacheResult, PeerId};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// File name of the persisted identity inside the cache directory.
pub const IDENTITY_FILE: &str = "identity.json";

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    /// Hex-encoded ed25519 secret key.
    secret_key: String,
}

/// A node's ed25519 keypair and the peer id derived from it.
#[derive(Clone)]
pub struct PeerIdentity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl PeerIdentity {
    /// Generate an ephemeral identity. Used for tests and for memory-only
    /// nodes with nowhere to persist.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Load the identity persisted in `dir`, generating and persisting a
    /// fresh one on first run.
    pub fn load_or_generate(dir: &Path) -> CacheResult<Self> {
        let path = dir.join(IDENTITY_FILE);

        if let Ok(bytes) = fs::read(&path) {
            let persisted: PersistedIdentity = serde_json::from_slice(&bytes).map_err(|e| {
                CacheError::serialization(format!("Corrupt identity file: {}", e))
            })?;
            let secret = hex::decode(&persisted.secret_key)
                .map_err(|e| CacheError::crypto(format!("Bad identity key hex: {}", e)))?;
            let secret: [u8; 32] = secret
                .try_into()
                .map_err(|_| CacheError::crypto("Identity key must be 32 bytes"))?;
            let identity = Self::from_signing_key(SigningKey::from_bytes(&secret));
            debug!(peer_id = %identity.peer_id.short(), "Loaded persisted identity");
            return Ok(identity);
        }

        let identity = Self::generate();
        fs::create_dir_all(dir)
            .map_err(|e| CacheError::storage(format!("Failed to create {}: {}", dir.display(), e)))?;
        let persisted = PersistedIdentity {
            secret_key: hex::encode(identity.signing_key.to_bytes()),
        };
        let json = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| CacheError::serialization(format!("Identity serialization failed: {}", e)))?;
        fs::write(&path, json)
            .map_err(|e| CacheError::storage(format!("Failed to write {}: {}", path.display(), e)))?;

        info!(peer_id = %identity.peer_id.short(), "Generated new node identity");
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from_verifying_key(&signing_key.verifying_key());
        Self {
            signing_key,
            peer_id,
        }
    }

    /// Stable identifier derived from the verifying key.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The public half of the keypair.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "PeerIdentity({})", self.peer_id.short())
    }
}
