//! Message-level encryption for sync frames.
//!
//! The mesh key is derived from a shared secret (typically the remote-API
//! credential) with HKDF-SHA256, so only holders of that credential can
//! usefully join the cache-sharing mesh. Each frame body is sealed with
//! ChaCha20-Poly1305 under a random nonce prepended to the ciphertext.
//!
//! Without a secret the layer runs plaintext only if the operator has not
//! required encryption; otherwise P2P is disabled entirely (fail closed).

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use meshcache_core::{hash, CacheError, CacheResult};
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

/// HKDF salt binding derived keys to this protocol.
const KEY_SALT: &[u8] = b"meshcache-frame-key-v1";

/// Nonce length for ChaCha20-Poly1305.
const NONCE_LEN: usize = 12;

/// Seals and opens frame bodies.
pub enum FrameCipher {
    /// No encryption configured and none required.
    Plaintext,
    /// All frame bodies sealed under the mesh key.
    Sealed(Box<ChaCha20Poly1305>, [u8; 4]),
}

impl FrameCipher {
    /// Resolve the cipher from configuration.
    ///
    /// `Ok(None)` means P2P must stay disabled: encryption was required but
    /// no shared secret is available.
    pub fn from_config(
        shared_secret: Option<&str>,
        require_encryption: bool,
    ) -> CacheResult<Option<Self>> {
        match shared_secret {
            Some(secret) => Ok(Some(Self::sealed(secret)?)),
            None if require_encryption => {
                warn!("Encryption required but no shared secret configured, disabling P2P");
                Ok(None)
            }
            None => Ok(Some(Self::Plaintext)),
        }
    }

    /// Build a sealed cipher from the shared secret.
    pub fn sealed(shared_secret: &str) -> CacheResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), shared_secret.as_bytes());
        let mut key_bytes = [0u8; 32];
        hk.expand(b"frame-key", &mut key_bytes)
            .map_err(|e| CacheError::crypto(format!("Mesh key derivation failed: {}", e)))?;

        let mut key_hint = [0u8; 4];
        key_hint.copy_from_slice(&hash::hash(&key_bytes)[..4]);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Ok(Self::Sealed(Box::new(cipher), key_hint))
    }

    /// Whether frames are encrypted.
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed(..))
    }

    /// Short digest of the mesh key for diagnostics. Empty in plaintext
    /// mode.
    pub fn key_hint(&self) -> Option<[u8; 4]> {
        match self {
            Self::Plaintext => None,
            Self::Sealed(_, hint) => Some(*hint),
        }
    }

    /// Seal an encoded envelope into a frame body.
    pub fn seal(&self, plaintext: &[u8]) -> CacheResult<Vec<u8>> {
        match self {
            Self::Plaintext => Ok(plaintext.to_vec()),
            Self::Sealed(cipher, _) => {
                let mut nonce_bytes = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);
                let ciphertext = cipher
                    .encrypt(nonce, plaintext)
                    .map_err(|e| CacheError::crypto(format!("Frame encryption failed: {}", e)))?;

                let mut body = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                body.extend_from_slice(&nonce_bytes);
                body.extend(ciphertext);
                Ok(body)
            }
        }
    }

    /// Open a frame body back into the encoded envelope.
    pub fn open(&self, body: &[u8]) -> CacheResult<Vec<u8>> {
        match self {
            Self::Plaintext => Ok(body.to_vec()),
            Self::Sealed(cipher, _) => {
                if body.len() < NONCE_LEN {
                    return Err(CacheError::crypto("Frame too short for nonce"));
                }
                let nonce = Nonce::from_slice(&body[..NONCE_LEN]);
                cipher
                    .decrypt(nonce, &body[NONCE_LEN..])
                    .map_err(|_| CacheError::crypto("Frame decryption failed"))
            }
        }
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plaintext => f.write_str("FrameCipher::Plaintext"),
            Self::Sealed(_, hint) => write!(f, "FrameCipher::Sealed({})", hex::encode(hint)),
        }
    }
}
