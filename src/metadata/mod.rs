//! Series Identity Cache
//!
//! Maps `(metric name, app id, instance id, host name)` tuples to compact
//! fixed-width [`SeriesKey`]s so metric tables are keyed by 20 bytes instead of
//! four repeated strings:
//!
//! ```text
//! ┌──────────────────────────────┐     ┌───────────────┬──────────┐
//! │ cpu_user / HOST / - / host1  │────▶│ metric (16 B) │ host (4B)│
//! └──────────────────────────────┘     └───────────────┴──────────┘
//! ```
//!
//! # Concurrency
//!
//! Lookups hit a concurrent map (fast path). On a miss the caller takes a
//! per-tuple lock, re-checks the map, then consults the durable
//! [`SeriesMetadataStore`] and assigns if needed (slow path). Two concurrent
//! callers for the same tuple therefore always observe the same key, while
//! unrelated tuples never contend.
//!
//! Besides forward lookups the cache tracks:
//! - key → identity, used by the cluster aggregator to regroup raw rows
//! - host → app ids, used for app-level re-attribution of host metrics

pub mod keys;
pub mod store;

pub use keys::{host_key_for, metric_key_for, series_key_for};
pub use store::{InMemoryMetadataStore, SeriesMetadataStore};

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;
use crate::metrics;
use crate::types::{MetricIdentity, MetricKey, RowKey, SeriesIdentity, SeriesKey, HOST_APP_ID};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the identity cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Metric name patterns (`%` wildcard) that never receive a key
    #[serde(default)]
    pub transient_patterns: Vec<String>,
}

// ============================================================================
// Wildcards
// ============================================================================

/// Whether a name uses the SQL-style `%` wildcard
pub fn is_wildcard(name: &str) -> bool {
    name.contains('%')
}

/// Compile a `%` pattern into an anchored regex
pub fn wildcard_regex(pattern: &str) -> Result<Regex, MetadataError> {
    let body = pattern
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    Regex::new(&format!("^{}$", body)).map_err(|e| MetadataError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// A compiled name filter: exact names plus wildcard patterns
#[derive(Debug)]
struct NameMatcher {
    exact: BTreeSet<String>,
    patterns: Vec<Regex>,
}

impl NameMatcher {
    fn compile(names: &[String]) -> Result<Self, MetadataError> {
        let mut exact = BTreeSet::new();
        let mut patterns = Vec::new();
        for name in names {
            if is_wildcard(name) {
                patterns.push(wildcard_regex(name)?);
            } else {
                exact.insert(name.clone());
            }
        }
        Ok(Self { exact, patterns })
    }

    fn matches(&self, name: &str) -> bool {
        self.exact.contains(name) || self.patterns.iter().any(|p| p.is_match(name))
    }
}

// ============================================================================
// Series Identity Cache
// ============================================================================

/// Snapshot entry for export/import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntry {
    /// The tuple
    pub identity: SeriesIdentity,
    /// Its key
    pub key: SeriesKey,
}

/// Concurrent tuple → key cache backed by a durable store
pub struct SeriesIdentityCache {
    store: Arc<dyn SeriesMetadataStore>,

    /// Forward map
    keys: DashMap<SeriesIdentity, SeriesKey>,

    /// Reverse map for host tables
    identities: DashMap<SeriesKey, SeriesIdentity>,

    /// Reverse map for cluster tables
    metrics: DashMap<MetricKey, MetricIdentity>,

    /// App ids seen per host (excluding the host app id itself)
    hosted_apps: DashMap<String, BTreeSet<String>>,

    /// Per-tuple locks held only while a miss is being resolved
    pending: DashMap<SeriesIdentity, Arc<tokio::sync::Mutex<()>>>,

    transient: Vec<Regex>,
}

impl std::fmt::Debug for SeriesIdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesIdentityCache")
            .field("series", &self.keys.len())
            .field("metrics", &self.metrics.len())
            .field("hosts", &self.hosted_apps.len())
            .finish()
    }
}

impl SeriesIdentityCache {
    /// Create a cache over `store`
    pub fn new(
        store: Arc<dyn SeriesMetadataStore>,
        config: &MetadataConfig,
    ) -> Result<Self, MetadataError> {
        let transient = config
            .transient_patterns
            .iter()
            .map(|p| wildcard_regex(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            store,
            keys: DashMap::new(),
            identities: DashMap::new(),
            metrics: DashMap::new(),
            hosted_apps: DashMap::new(),
            pending: DashMap::new(),
            transient,
        })
    }

    /// Cache over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryMetadataStore::new()),
            keys: DashMap::new(),
            identities: DashMap::new(),
            metrics: DashMap::new(),
            hosted_apps: DashMap::new(),
            pending: DashMap::new(),
            transient: Vec::new(),
        }
    }

    /// Load every assignment from the durable store
    ///
    /// Returns the number of entries loaded.
    pub async fn warm_up(&self) -> Result<usize, MetadataError> {
        let entries = self.store.load_all().await?;
        let count = entries.len();
        for (identity, key) in entries {
            self.remember(&identity, key);
        }
        tracing::debug!(series = count, "Series identity cache warmed up");
        Ok(count)
    }

    /// Key for `identity`, assigning one on first sight
    ///
    /// Fails only when the durable store fails or the derived key is already
    /// owned by a different tuple.
    pub async fn get_or_assign_key(
        &self,
        identity: &SeriesIdentity,
    ) -> Result<SeriesKey, MetadataError> {
        // Fast path
        if let Some(key) = self.keys.get(identity) {
            return Ok(*key);
        }

        // Slow path: serialize resolution of this tuple
        let lock = self
            .pending
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        let guard = lock.lock().await;

        let result = self.resolve_miss(identity).await;

        drop(guard);
        self.release_pending(identity, &lock);
        result
    }

    /// Drop the tuple lock unless a later caller has already replaced it
    fn release_pending(&self, identity: &SeriesIdentity, lock: &Arc<tokio::sync::Mutex<()>>) {
        self.pending.remove_if(identity, |_, current| Arc::ptr_eq(current, lock));
    }

    /// Key for an ingested tuple, or `None` for transient metrics
    pub async fn key_for_ingest(
        &self,
        identity: &SeriesIdentity,
    ) -> Result<Option<SeriesKey>, MetadataError> {
        if self.is_transient(&identity.metric.metric_name) {
            return Ok(None);
        }
        self.get_or_assign_key(identity).await.map(Some)
    }

    async fn resolve_miss(&self, identity: &SeriesIdentity) -> Result<SeriesKey, MetadataError> {
        // Double-check after acquiring the tuple lock
        if let Some(key) = self.keys.get(identity) {
            return Ok(*key);
        }

        let key = match self.store.lookup(identity).await? {
            Some(key) => key,
            None => {
                let derived = series_key_for(identity);
                self.check_collision(derived, identity)?;
                let key = self.store.assign(identity, derived).await?;
                metrics::record_key_assigned();
                tracing::debug!(series = %identity, key = %key, "Assigned series key");
                key
            },
        };

        self.remember(identity, key);
        Ok(key)
    }

    fn check_collision(
        &self,
        key: SeriesKey,
        identity: &SeriesIdentity,
    ) -> Result<(), MetadataError> {
        if let Some(existing) = self.identities.get(&key) {
            if existing.value() != identity {
                tracing::error!(
                    key = %key,
                    requested = %identity,
                    existing = %existing.value(),
                    "Series key collision"
                );
                metrics::record_key_collision();
                return Err(MetadataError::KeyCollision {
                    key: key.to_string(),
                    requested: identity.to_string(),
                    existing: existing.value().to_string(),
                });
            }
        }
        Ok(())
    }

    fn remember(&self, identity: &SeriesIdentity, key: SeriesKey) {
        self.keys.insert(identity.clone(), key);
        self.identities.insert(key, identity.clone());
        self.metrics
            .entry(key.metric_key())
            .or_insert_with(|| identity.metric.clone());

        if identity.metric.app_id != HOST_APP_ID {
            self.hosted_apps
                .entry(identity.host_name.clone())
                .or_default()
                .insert(identity.metric.app_id.clone());
        }
    }

    /// Whether `metric_name` matches a transient pattern
    pub fn is_transient(&self, metric_name: &str) -> bool {
        self.transient.iter().any(|p| p.is_match(metric_name))
    }

    /// Cached key for `identity` without touching the store
    pub fn cached_key(&self, identity: &SeriesIdentity) -> Option<SeriesKey> {
        self.keys.get(identity).map(|k| *k)
    }

    /// Tuple owning `key`
    pub fn identity_of(&self, key: &SeriesKey) -> Option<SeriesIdentity> {
        self.identities.get(key).map(|e| e.value().clone())
    }

    /// App ids reported from `host_name`, sorted
    pub fn hosted_apps(&self, host_name: &str) -> Vec<String> {
        self.hosted_apps
            .get(host_name)
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of known series
    pub fn series_count(&self) -> usize {
        self.keys.len()
    }

    /// Resolve query names into row keys
    ///
    /// With `host_patterns` empty the result holds metric keys (cluster
    /// tables), otherwise series keys (host tables). Names and hosts may use
    /// `%` wildcards; `app_id` and `instance_id` filter exactly when given.
    /// The result is sorted and free of duplicates.
    pub fn resolve_keys(
        &self,
        metric_patterns: &[String],
        host_patterns: &[String],
        app_id: Option<&str>,
        instance_id: Option<&str>,
    ) -> Result<Vec<RowKey>, MetadataError> {
        let metric_matcher = NameMatcher::compile(metric_patterns)?;
        let matches_metric = |m: &MetricIdentity| {
            metric_matcher.matches(&m.metric_name)
                && app_id.map_or(true, |a| a == m.app_id)
                && instance_id.map_or(true, |i| m.instance_id.as_deref() == Some(i))
        };

        let mut keys: Vec<RowKey> = if host_patterns.is_empty() {
            self.metrics
                .iter()
                .filter(|e| matches_metric(e.value()))
                .map(|e| RowKey::Metric(*e.key()))
                .collect()
        } else {
            let host_matcher = NameMatcher::compile(host_patterns)?;
            self.identities
                .iter()
                .filter(|e| {
                    host_matcher.matches(&e.value().host_name) && matches_metric(&e.value().metric)
                })
                .map(|e| RowKey::Series(*e.key()))
                .collect()
        };

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Export every cached assignment, sorted by key
    pub fn export_all(&self) -> Vec<SeriesEntry> {
        let mut entries: Vec<SeriesEntry> = self
            .keys
            .iter()
            .map(|e| SeriesEntry {
                identity: e.key().clone(),
                key: *e.value(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Import assignments, e.g. from a snapshot taken with `export_all`
    pub fn import(&self, entries: Vec<SeriesEntry>) {
        for entry in entries {
            self.remember(&entry.identity, entry.key);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(metric: &str, app: &str, host: &str) -> SeriesIdentity {
        MetricIdentity::new(metric, app).on_host(host)
    }

    #[test]
    fn test_wildcard_regex() {
        let re = wildcard_regex("regionserver.%.requests").unwrap();
        assert!(re.is_match("regionserver.Server.requests"));
        assert!(!re.is_match("regionserver.Server.requests.extra"));

        // Regex metacharacters in names are literal
        let re = wildcard_regex("jvm.(gc)").unwrap();
        assert!(re.is_match("jvm.(gc)"));
        assert!(!re.is_match("jvm.gc"));
    }

    #[tokio::test]
    async fn test_same_tuple_same_key() {
        let cache = SeriesIdentityCache::in_memory();
        let id = identity("cpu_user", "HOST", "h1");

        let k1 = cache.get_or_assign_key(&id).await.unwrap();
        let k2 = cache.get_or_assign_key(&id).await.unwrap();
        assert_eq!(k1, k2);
        assert_eq!(cache.identity_of(&k1), Some(id.clone()));
        assert_eq!(cache.cached_key(&id), Some(k1));
        assert_eq!(cache.series_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_assignment_single_key() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let cache = Arc::new(
            SeriesIdentityCache::new(store.clone(), &MetadataConfig::default()).unwrap(),
        );
        let id = identity("mem_free", "HOST", "h9");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_assign_key(&id).await.unwrap()
            }));
        }

        let mut keys = Vec::new();
        for h in handles {
            keys.push(h.await.unwrap());
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);
        assert_eq!(store.len(), 1);
        // Only the first miss reaches the store
        assert_eq!(store.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_release_keeps_replaced_tuple_lock() {
        let cache = SeriesIdentityCache::in_memory();
        let id = identity("cpu_user", "HOST", "h1");
        let ours = Arc::new(tokio::sync::Mutex::new(()));
        let theirs = Arc::new(tokio::sync::Mutex::new(()));

        // A later caller installed its own lock after ours was taken out
        cache.pending.insert(id.clone(), theirs.clone());
        cache.release_pending(&id, &ours);
        assert!(cache.pending.contains_key(&id));

        cache.release_pending(&id, &theirs);
        assert!(!cache.pending.contains_key(&id));

        cache.get_or_assign_key(&id).await.unwrap();
        assert!(cache.pending.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let cache = SeriesIdentityCache::new(store.clone(), &MetadataConfig::default()).unwrap();
        store.fail_next_calls(1);

        let id = identity("cpu_user", "HOST", "h1");
        let err = cache.get_or_assign_key(&id).await.unwrap_err();
        assert!(matches!(err, MetadataError::Store(_)));

        // Next attempt succeeds once the store is back
        assert!(cache.get_or_assign_key(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_metrics_get_no_key() {
        let config = MetadataConfig {
            transient_patterns: vec!["topology.%".to_string()],
        };
        let cache =
            SeriesIdentityCache::new(Arc::new(InMemoryMetadataStore::new()), &config).unwrap();

        let transient = identity("topology.t1.latency", "nimbus", "h1");
        assert_eq!(cache.key_for_ingest(&transient).await.unwrap(), None);

        let regular = identity("cpu_user", "HOST", "h1");
        assert!(cache.key_for_ingest(&regular).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_warm_up_from_store() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let id = identity("cpu_user", "HOST", "h1");
        store.assign(&id, series_key_for(&id)).await.unwrap();

        let cache = SeriesIdentityCache::new(store, &MetadataConfig::default()).unwrap();
        assert_eq!(cache.warm_up().await.unwrap(), 1);
        assert_eq!(cache.cached_key(&id), Some(series_key_for(&id)));
    }

    #[tokio::test]
    async fn test_hosted_apps_and_resolution() {
        let cache = SeriesIdentityCache::in_memory();
        for host in ["h1", "h2", "h3"] {
            cache
                .get_or_assign_key(&identity("cpu_user", "HOST", host))
                .await
                .unwrap();
        }
        cache
            .get_or_assign_key(&identity("app_requests", "app1", "h1"))
            .await
            .unwrap();

        assert_eq!(cache.hosted_apps("h1"), vec!["app1".to_string()]);
        assert!(cache.hosted_apps("h2").is_empty());

        let all_hosts = cache
            .resolve_keys(&["cpu_user".to_string()], &["h%".to_string()], None, None)
            .unwrap();
        assert_eq!(all_hosts.len(), 3);

        let two = cache
            .resolve_keys(
                &["cpu_user".to_string()],
                &["h1".to_string(), "h2".to_string()],
                Some("HOST"),
                None,
            )
            .unwrap();
        assert_eq!(two.len(), 2);

        let cluster = cache
            .resolve_keys(&["%".to_string()], &[], None, None)
            .unwrap();
        assert_eq!(cluster.len(), 2);
        assert!(cluster.iter().all(|k| matches!(k, RowKey::Metric(_))));
    }

    #[tokio::test]
    async fn test_export_import() {
        let cache = SeriesIdentityCache::in_memory();
        cache
            .get_or_assign_key(&identity("a", "HOST", "h1"))
            .await
            .unwrap();
        cache
            .get_or_assign_key(&identity("b", "HOST", "h1"))
            .await
            .unwrap();

        let snapshot = cache.export_all();
        let restored = SeriesIdentityCache::in_memory();
        restored.import(snapshot.clone());
        assert_eq!(restored.export_all(), snapshot);
    }
}
