//! Scan-result cache: a thin policy layer over the generic store.
//!
//! Demonstrates the boundary between the core cache and domain policy:
//! this crate owns no persistence or networking. It derives a cache key
//! from `(repo, commit_sha, scan_config)`, wraps results with their scan
//! timestamp, and decides whether a scan can be skipped. Freshness rules
//! live entirely here; the generic store only enforces TTL.

use meshcache_core::{hash, time, CacheResult};
use meshcache_store::CacheStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Namespace isolating scan results from other cache domains.
pub const SCAN_NAMESPACE: &str = "codeql";

/// Default freshness threshold: results older than this trigger a re-scan
/// when relevant files changed (24 hours).
pub const DEFAULT_FRESHNESS_SECS: u64 = 24 * 60 * 60;

/// TTL for stored scan results. Deliberately longer than the freshness
/// threshold: an old result is still servable when nothing relevant to
/// the scanned language changed.
pub const SCAN_RESULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Capability for policy-layer observability. Implementations are
/// provided by the embedding application; the default discards values.
pub trait MetricsSink: Send + Sync {
    /// Record one counter observation.
    fn record(&self, name: &str, value: u64);
}

/// Discards all metrics.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _name: &str, _value: u64) {}
}

/// What was scanned and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Language the scan targets (e.g. `"python"`).
    pub language: String,
    /// Query suite identifier.
    pub query_suite: String,
}

impl ScanConfig {
    /// Digest of the config, part of the cache key: a changed suite or
    /// language must never reuse results.
    pub fn config_hash(&self) -> String {
        let mut fields = BTreeMap::new();
        fields.insert("language".to_string(), json!(self.language));
        fields.insert("query_suite".to_string(), json!(self.query_suite));
        hash::validation_hash(&fields)
    }
}

/// Outcome of a skip decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipDecision {
    /// Whether the scan can be skipped.
    pub skip: bool,
    /// The cached result, when one backs the decision.
    pub cached_result: Option<Value>,
}

/// Caches expensive scan results keyed by repo, commit, and config.
pub struct ScanResultCache {
    store: Arc<CacheStore>,
    freshness_threshold_secs: u64,
    metrics: Arc<dyn MetricsSink>,
}

impl ScanResultCache {
    /// Wrap a store with default freshness rules.
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            freshness_threshold_secs: DEFAULT_FRESHNESS_SECS,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Override the freshness threshold.
    pub fn with_freshness_threshold(mut self, secs: u64) -> Self {
        self.freshness_threshold_secs = secs;
        self
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn cache_key(repo: &str, commit_sha: &str, config: &ScanConfig) -> String {
        format!("{}@{}:{}", repo, commit_sha, config.config_hash())
    }

    /// Store a completed scan result.
    pub fn record_scan(
        &self,
        repo: &str,
        commit_sha: &str,
        config: &ScanConfig,
        result: Value,
    ) -> CacheResult<()> {
        // The scan timestamp is policy data, so it rides inside the
        // payload rather than in the generic store's metadata.
        let wrapped = json!({
            "scanned_at": time::now_seconds(),
            "language": config.language,
            "result": result,
        });
        self.store.put(
            SCAN_NAMESPACE,
            &Self::cache_key(repo, commit_sha, config),
            wrapped,
            Some(SCAN_RESULT_TTL_SECS),
            Some(config.config_hash()),
        )?;
        self.metrics.record("scan_cache.stored", 1);
        Ok(())
    }

    /// Decide whether a scan can be skipped.
    ///
    /// - No cached entry: never skip.
    /// - `changed_files` given and none are relevant to the scanned
    ///   language: skip regardless of age.
    /// - Otherwise skip only while the cached result is younger than the
    ///   freshness threshold.
    pub fn should_skip_scan(
        &self,
        repo: &str,
        commit_sha: &str,
        config: &ScanConfig,
        changed_files: Option<&[String]>,
    ) -> SkipDecision {
        let key = Self::cache_key(repo, commit_sha, config);
        let Some((wrapped, _)) = self.store.get(SCAN_NAMESPACE, &key) else {
            self.metrics.record("scan_cache.miss", 1);
            return SkipDecision {
                skip: false,
                cached_result: None,
            };
        };

        let result = wrapped.get("result").cloned();

        if let Some(files) = changed_files {
            let extensions = language_extensions(&config.language);
            let relevant_change = files.iter().any(|f| is_relevant(f, extensions));
            if !relevant_change {
                debug!(repo, commit_sha, "No relevant files changed, serving cached scan");
                self.metrics.record("scan_cache.skip_irrelevant", 1);
                return SkipDecision {
                    skip: true,
                    cached_result: result,
                };
            }
        }

        let scanned_at = wrapped.get("scanned_at").and_then(Value::as_u64).unwrap_or(0);
        let age = time::now_seconds().saturating_sub(scanned_at);
        if age < self.freshness_threshold_secs {
            self.metrics.record("scan_cache.skip_fresh", 1);
            SkipDecision {
                skip: true,
                cached_result: result,
            }
        } else {
            self.metrics.record("scan_cache.stale", 1);
            SkipDecision {
                skip: false,
                cached_result: result,
            }
        }
    }
}

/// File extensions the scanner cares about, per language.
fn language_extensions(language: &str) -> &'static [&'static str] {
    match language {
        "python" => &[".py", ".pyi"],
        "javascript" | "typescript" => &[".js", ".jsx", ".mjs", ".cjs", ".ts", ".tsx"],
        "java" | "kotlin" => &[".java", ".kt", ".kts"],
        "go" => &[".go"],
        "rust" => &[".rs"],
        "ruby" => &[".rb", ".erb"],
        "cpp" | "c" => &[".c", ".cc", ".cpp", ".cxx", ".h", ".hh", ".hpp"],
        "csharp" => &[".cs"],
        "swift" => &[".swift"],
        // Unknown language: treat every change as relevant.
        _ => &[],
    }
}

fn is_relevant(file: &str, extensions: &'static [&'static str]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    extensions.iter().any(|ext| file.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcache_core::CacheConfig;
    use meshcache_store::CacheEntry;
    use parking_lot::Mutex;

    fn scan_cache() -> ScanResultCache {
        let config = CacheConfig {
            enable_persistence: false,
            ..CacheConfig::default()
        };
        ScanResultCache::new(CacheStore::new(&config).unwrap())
    }

    fn python_config() -> ScanConfig {
        ScanConfig {
            language: "python".to_string(),
            query_suite: "security-extended".to_string(),
        }
    }

    #[test]
    fn no_cached_entry_never_skips() {
        let cache = scan_cache();
        let decision = cache.should_skip_scan("org/repo", "abc123", &python_config(), None);
        assert!(!decision.skip);
        assert!(decision.cached_result.is_none());
    }

    #[test]
    fn irrelevant_changes_skip_regardless_of_age() {
        let cache = scan_cache().with_freshness_threshold(0);
        let config = python_config();
        cache
            .record_scan("org/repo", "abc123", &config, json!({"alerts": []}))
            .unwrap();

        let changed = vec!["README.md".to_string(), "docs/guide.rst".to_string()];
        let decision = cache.should_skip_scan("org/repo", "abc123", &config, Some(&changed));
        assert!(decision.skip);
        assert_eq!(decision.cached_result, Some(json!({"alerts": []})));
    }

    #[test]
    fn relevant_changes_respect_freshness() {
        let cache = scan_cache();
        let config = python_config();
        cache
            .record_scan("org/repo", "abc123", &config, json!({"alerts": [1]}))
            .unwrap();

        // A just-recorded scan is fresh, so even a relevant change skips.
        let changed = vec!["src/app.py".to_string()];
        let decision = cache.should_skip_scan("org/repo", "abc123", &config, Some(&changed));
        assert!(decision.skip);
    }

    #[test]
    fn stale_results_trigger_a_rescan() {
        let cache = scan_cache();
        let config = python_config();
        let key = ScanResultCache::cache_key("org/repo", "abc123", &config);

        // Back-date the scan two days; the 7-day TTL still holds it.
        let scanned_at = time::now_seconds() - 2 * 24 * 60 * 60;
        cache.store.insert_entry(CacheEntry::local(
            SCAN_NAMESPACE,
            key,
            json!({"scanned_at": scanned_at, "language": "python", "result": {"alerts": []}}),
            SCAN_RESULT_TTL_SECS,
            Some(config.config_hash()),
            scanned_at,
        ));

        let changed = vec!["src/app.py".to_string()];
        let decision = cache.should_skip_scan("org/repo", "abc123", &config, Some(&changed));
        assert!(!decision.skip);
        // The stale result is still returned for diffing/telemetry.
        assert!(decision.cached_result.is_some());
    }

    #[test]
    fn changed_config_misses_the_cache() {
        let cache = scan_cache();
        let config = python_config();
        cache
            .record_scan("org/repo", "abc123", &config, json!({"alerts": []}))
            .unwrap();

        let other = ScanConfig {
            query_suite: "security-and-quality".to_string(),
            ..python_config()
        };
        let decision = cache.should_skip_scan("org/repo", "abc123", &other, None);
        assert!(!decision.skip);
    }

    #[test]
    fn unknown_language_treats_all_changes_as_relevant() {
        let cache = scan_cache().with_freshness_threshold(0);
        let config = ScanConfig {
            language: "cobol".to_string(),
            query_suite: "default".to_string(),
        };
        cache
            .record_scan("org/repo", "abc123", &config, json!({}))
            .unwrap();

        let changed = vec!["README.md".to_string()];
        let decision = cache.should_skip_scan("org/repo", "abc123", &config, Some(&changed));
        // Zero freshness threshold plus relevant-by-default change: re-scan.
        assert!(!decision.skip);
    }

    #[test]
    fn metrics_sink_sees_decisions() {
        struct Recording(Mutex<Vec<String>>);
        impl MetricsSink for Recording {
            fn record(&self, name: &str, _value: u64) {
                self.0.lock().push(name.to_string());
            }
        }

        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let cache = scan_cache().with_metrics(sink.clone());
        let config = python_config();

        cache.should_skip_scan("org/repo", "abc123", &config, None);
        cache
            .record_scan("org/repo", "abc123", &config, json!({}))
            .unwrap();
        cache.should_skip_scan("org/repo", "abc123", &config, None);

        let seen = sink.0.lock().clone();
        assert_eq!(
            seen,
            vec![
                "scan_cache.miss".to_string(),
                "scan_cache.stored".to_string(),
                "scan_cache.skip_fresh".to_string(),
            ]
        );
    }
}
