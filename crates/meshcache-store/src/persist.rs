//! On-disk persistence, one JSON document per namespace.
//!
//! The format is the interoperability surface: any implementation honoring
//! the same document shape can read files written here. Unknown fields are
//! ignored on load and missing optional fields are tolerated, so the format
//! can grow without breaking older readers.
//!
//! Writes are atomic: serialize to a temp file in the same directory, then
//! rename over the target. The file is owned by the process that wrote it;
//! directories shared between processes are last-writer-wins.

use crate::entry::{CacheEntry, EntrySource};
use meshcache_core::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persisted file schema version.
pub const FILE_SCHEMA_VERSION: u32 = 1;

/// One record in a namespace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Key within the namespace.
    pub key: String,
    /// JSON-encodable payload.
    pub value: serde_json::Value,
    /// Unix seconds at write time.
    pub created_at: u64,
    /// Lifetime in seconds.
    pub ttl_seconds: u64,
    /// Validation digest; absent means no validation check available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_hash: Option<String>,
}

/// Whole-namespace document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceFile {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// All live entries for the namespace.
    #[serde(default)]
    pub entries: Vec<PersistedEntry>,
}

/// Path of the file backing `namespace` under `dir`.
pub fn namespace_path(dir: &Path, namespace: &str) -> PathBuf {
    // Namespaces are caller-chosen strings; keep the filename safe.
    let safe: String = namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{}.json", safe))
}

/// Write all entries of a namespace to its file atomically.
pub fn save_namespace(dir: &Path, namespace: &str, entries: &[CacheEntry]) -> CacheResult<()> {
    let doc = NamespaceFile {
        schema_version: FILE_SCHEMA_VERSION,
        entries: entries
            .iter()
            .map(|e| PersistedEntry {
                key: e.key.clone(),
                value: e.value.clone(),
                created_at: e.created_at,
                ttl_seconds: e.ttl_seconds,
                validation_hash: e.validation_hash.clone(),
            })
            .collect(),
    };

    fs::create_dir_all(dir)
        .map_err(|e| CacheError::storage(format!("Failed to create {}: {}", dir.display(), e)))?;

    let json = serde_json::to_vec_pretty(&doc)
        .map_err(|e| CacheError::serialization(format!("Namespace serialization failed: {}", e)))?;

    let target = namespace_path(dir, namespace);
    let tmp = target.with_extension("json.tmp");
    fs::write(&tmp, &json)
        .map_err(|e| CacheError::storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, &target)
        .map_err(|e| CacheError::storage(format!("Failed to rename {}: {}", tmp.display(), e)))?;

    debug!(namespace, entries = doc.entries.len(), "Persisted namespace");
    Ok(())
}

/// Load a namespace file, discarding entries already past their TTL.
///
/// A missing file yields an empty list; a corrupt file is logged and
/// treated as empty rather than surfaced, since degraded persistence only
/// costs cache hits.
pub fn load_namespace(dir: &Path, namespace: &str, now: u64) -> Vec<CacheEntry> {
    let path = namespace_path(dir, namespace);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(_) => return Vec::new(),
    };

    let doc: NamespaceFile = match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(namespace, path = %path.display(), error = %e, "Discarding corrupt cache file");
            return Vec::new();
        }
    };

    doc.entries
        .into_iter()
        .map(|p| CacheEntry {
            namespace: namespace.to_string(),
            key: p.key,
            value: p.value,
            created_at: p.created_at,
            ttl_seconds: p.ttl_seconds,
            validation_hash: p.validation_hash,
            source: EntrySource::Local,
        })
        .filter(|e| !e.is_expired(now))
        .collect()
}

/// List namespaces that have a persisted file under `dir`.
pub fn list_namespaces(dir: &Path) -> Vec<String> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    read.filter_map(|entry| {
        let path = entry.ok()?.path();
        if path.extension()? == "json" {
            Some(path.file_stem()?.to_string_lossy().into_owned())
        } else {
            None
        }
    })
    .collect()
}
