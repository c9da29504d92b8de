//! Sync wire format.
//!
//! Frames carry a magic header and a JSON envelope so that independent
//! implementations honoring the same shape can interoperate. The envelope
//! embeds a schema version checked on decode; no ordering or delivery
//! guarantee is made across peers.

use meshcache_core::{CacheError, CacheResult, PeerId};
use meshcache_peers::PeerAdvert;
use serde::{Deserialize, Serialize};

/// Wire schema version.
pub const WIRE_SCHEMA_VERSION: u16 = 1;

/// Magic bytes identifying meshcache sync frames.
pub const MAGIC_BYTES: &[u8; 4] = b"MESH";

/// Upper bound on a single frame body.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Message bodies exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncPayload {
    /// Handshake: identifies the sender and where it can be dialed back.
    Hello {
        /// Port the sender's listener is bound to.
        listen_port: u16,
    },
    /// Lightweight notification of a fresh local write. Receivers may
    /// FETCH if they lack the entry or hold a different validation hash.
    Announce {
        /// Namespace of the written entry.
        namespace: String,
        /// Key of the written entry.
        key: String,
        /// Validation digest at write time, if any.
        validation_hash: Option<String>,
        /// Seconds of TTL remaining at announcement time.
        ttl_remaining: u64,
    },
    /// Pull-based retrieval of one entry.
    Fetch {
        /// Namespace to look up.
        namespace: String,
        /// Key to look up.
        key: String,
    },
    /// Answer to a FETCH.
    FetchReply {
        /// Namespace that was looked up.
        namespace: String,
        /// Key that was looked up.
        key: String,
        /// Whether the responder held a live entry.
        found: bool,
        /// Payload when found.
        value: Option<serde_json::Value>,
        /// Seconds of TTL remaining at reply time.
        ttl_remaining: u64,
        /// Validation digest the responder stored, if any.
        validation_hash: Option<String>,
    },
    /// Ask a peer for its known peers (one discovery hop).
    GossipPeersRequest,
    /// A peer's known-peer list.
    GossipPeers {
        /// Advertised peers.
        peers: Vec<PeerAdvert>,
    },
}

/// Versioned envelope around every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// Schema version of the sender.
    pub schema_version: u16,
    /// Sender's stable peer id.
    pub from: PeerId,
    /// The message body.
    pub payload: SyncPayload,
}

impl SyncEnvelope {
    /// Wrap a payload in a current-version envelope.
    pub fn new(from: PeerId, payload: SyncPayload) -> Self {
        Self {
            schema_version: WIRE_SCHEMA_VERSION,
            from,
            payload,
        }
    }

    /// Serialize to a magic-prefixed JSON body.
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| CacheError::serialization(format!("Envelope encoding failed: {}", e)))?;
        let mut bytes = Vec::with_capacity(MAGIC_BYTES.len() + json.len());
        bytes.extend_from_slice(MAGIC_BYTES);
        bytes.extend(json);
        Ok(bytes)
    }

    /// Deserialize, validating magic header and schema version.
    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        if bytes.len() < MAGIC_BYTES.len() || &bytes[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return Err(CacheError::serialization("Missing frame magic"));
        }
        let envelope: SyncEnvelope = serde_json::from_slice(&bytes[MAGIC_BYTES.len()..])
            .map_err(|e| CacheError::serialization(format!("Envelope decoding failed: {}", e)))?;
        if envelope.schema_version != WIRE_SCHEMA_VERSION {
            return Err(CacheError::serialization(format!(
                "Unsupported schema version {}",
                envelope.schema_version
            )));
        }
        Ok(envelope)
    }
}
