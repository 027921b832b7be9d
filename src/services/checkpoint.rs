//! Checkpoint persistence
//!
//! Each rollup level remembers the end of the last window it aggregated
//! under a fixed checkpoint name. Two stores are provided:
//!
//! - [`InMemoryCheckpointStore`] for tests and dry runs
//! - [`FileCheckpointStore`], one small JSON file per checkpoint, guarded by a
//!   CRC-64 checksum and replaced atomically (temp file + rename)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use crc::{Crc, CRC_64_ECMA_182};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StorageError;
use crate::types::Timestamp;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Durable per-level progress markers
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted checkpoint of `name`, if any
    async fn read_checkpoint(&self, name: &str) -> Result<Option<Timestamp>, StorageError>;

    /// Persist `value` as the checkpoint of `name`
    async fn write_checkpoint(&self, name: &str, value: Timestamp) -> Result<(), StorageError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Checkpoints held in memory
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Timestamp>>,
    writes: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint without counting it as a write
    pub fn seed(&self, name: &str, value: Timestamp) {
        self.checkpoints.write().insert(name.to_string(), value);
    }

    /// Current value of `name`
    pub fn get(&self, name: &str) -> Option<Timestamp> {
        self.checkpoints.read().get(name).copied()
    }

    /// Successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` writes fail
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn read_checkpoint(&self, name: &str) -> Result<Option<Timestamp>, StorageError> {
        Ok(self.get(name))
    }

    async fn write_checkpoint(&self, name: &str, value: Timestamp) -> Result<(), StorageError> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Connection(
                "checkpoint store unavailable".to_string(),
            ));
        }
        self.checkpoints.write().insert(name.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// On-disk form of one checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    name: String,
    checkpoint: Timestamp,
    checksum: u64,
}

fn checksum_of(name: &str, value: Timestamp) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(name.as_bytes());
    digest.update(&value.to_le_bytes());
    digest.finalize()
}

/// Checkpoints stored as one file per name under a directory
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    temp_counter: AtomicU64,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Directory holding the checkpoint files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StorageError::CorruptedData(format!(
                "invalid checkpoint name '{}'",
                name
            )));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read_checkpoint(&self, name: &str) -> Result<Option<Timestamp>, StorageError> {
        let path = self.path_for(name)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: CheckpointFile = serde_json::from_str(&contents)?;
        if file.name != name {
            return Err(StorageError::CorruptedData(format!(
                "checkpoint file {} belongs to '{}'",
                path.display(),
                file.name
            )));
        }

        let actual = checksum_of(&file.name, file.checkpoint);
        if actual != file.checksum {
            tracing::error!(
                checkpoint = name,
                path = %path.display(),
                "Checkpoint checksum mismatch"
            );
            return Err(StorageError::ChecksumMismatch {
                expected: file.checksum,
                actual,
            });
        }

        Ok(Some(file.checkpoint))
    }

    async fn write_checkpoint(&self, name: &str, value: Timestamp) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir).await?;

        let contents = serde_json::to_string(&CheckpointFile {
            name: name.to_string(),
            checkpoint: value,
            checksum: checksum_of(name, value),
        })?;

        let temp_path = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            name,
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp_path, contents).await?;

        let renamed = fs::rename(&temp_path, &path).await;
        if renamed.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        renamed?;
        Ok(())
    }
}
