//! Durable backing for the series identity cache

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StorageError;
use crate::types::{SeriesIdentity, SeriesKey};

/// Durable store of assigned series keys
#[async_trait]
pub trait SeriesMetadataStore: Send + Sync {
    /// Key previously assigned to `identity`, if any
    async fn lookup(&self, identity: &SeriesIdentity) -> Result<Option<SeriesKey>, StorageError>;

    /// Persist `key` for `identity`
    ///
    /// If the identity already has a key the stored key wins and is returned,
    /// so a racing assignment from another process never rebinds a tuple.
    async fn assign(
        &self,
        identity: &SeriesIdentity,
        key: SeriesKey,
    ) -> Result<SeriesKey, StorageError>;

    /// Every stored assignment, used to warm the cache on startup
    async fn load_all(&self) -> Result<Vec<(SeriesIdentity, SeriesKey)>, StorageError>;
}

/// In-memory metadata store
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    entries: RwLock<HashMap<SeriesIdentity, SeriesKey>>,
    lookups: AtomicUsize,
    failing_calls: AtomicUsize,
}

impl InMemoryMetadataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `lookup` calls served
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of stored assignments
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been assigned
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Make the next `n` calls fail with a connection error
    pub fn fail_next_calls(&self, n: usize) {
        self.failing_calls.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        let failed = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Connection(
                "metadata store unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SeriesMetadataStore for InMemoryMetadataStore {
    async fn lookup(&self, identity: &SeriesIdentity) -> Result<Option<SeriesKey>, StorageError> {
        self.check()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.read().get(identity).copied())
    }

    async fn assign(
        &self,
        identity: &SeriesIdentity,
        key: SeriesKey,
    ) -> Result<SeriesKey, StorageError> {
        self.check()?;
        let mut entries = self.entries.write();
        Ok(*entries.entry(identity.clone()).or_insert(key))
    }

    async fn load_all(&self) -> Result<Vec<(SeriesIdentity, SeriesKey)>, StorageError> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(identity, key)| (identity.clone(), *key))
            .collect())
    }
}
