//! Centralized content hashing.
//!
//! One module owns the digest algorithm used throughout the workspace for
//! content addressing: peer identifiers, cipher key hints, and the
//! validation hasher callers use to detect staleness independent of TTL.
//!
//! Current algorithm: **SHA-256** (32-byte output). Digests rendered as
//! strings carry a self-describing `sha256:` prefix so a future algorithm
//! change stays distinguishable from old values.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Prefix identifying the digest algorithm in rendered hashes.
pub const DIGEST_PREFIX: &str = "sha256:";

/// Hash arbitrary bytes to a 32-byte digest
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash bytes and render as a self-describing string (`sha256:<hex>`)
pub fn hash_string(data: &[u8]) -> String {
    format!("{}{}", DIGEST_PREFIX, hex::encode(hash(data)))
}

/// Deterministic digest of caller-supplied validation fields.
///
/// Callers pass the fields that, if changed, mean a cached entry is stale
/// even though its TTL has not expired (e.g. a resource's `updatedAt`).
/// `BTreeMap` iteration gives lexicographic key order, so the result does
/// not depend on the order the caller inserted fields.
///
/// Pure function: identical mappings always produce identical output. The
/// cache itself never recomputes or compares these digests; that stays with
/// the caller, which is the only party able to observe the live fields.
pub fn validation_hash(fields: &BTreeMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in fields {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.to_string().as_bytes());
        hasher.update([0x1e]);
    }
    let digest: [u8; 32] = hasher.finalize().into();
    format!("{}{}", DIGEST_PREFIX, hex::encode(digest))
}
