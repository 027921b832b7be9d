//! Error types for the rollup engine

use thiserror::Error;

use crate::query::PlanError;
use crate::services::ServiceError;
use crate::storage::SplitPointError;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Series metadata error
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Aggregation step error
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Query planning error
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Split point computation error
    #[error("Split point error: {0}")]
    SplitPoints(#[from] SplitPointError),

    /// Service framework error
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the external stores (raw points, aggregates, checkpoints)
///
/// All of these are treated as transient by the schedulers: the failed window
/// is retried on the next cycle.
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Stored data failed validation
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum recorded alongside the data
        expected: u64,
        /// Checksum computed from the data
        actual: u64,
    },

    /// Encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Requested table is unknown to the backend
    #[error("Unknown table: {0}")]
    UnknownTable(String),
}

/// Series metadata errors
#[derive(Error, Debug)]
pub enum MetadataError {
    /// Durable metadata store failed
    #[error("Metadata store error: {0}")]
    Store(#[from] StorageError),

    /// Derived key is already owned by a different series
    #[error("Key {key} for '{requested}' already assigned to '{existing}'")]
    KeyCollision {
        /// Hex form of the colliding key
        key: String,
        /// Series that asked for the key
        requested: String,
        /// Series that owns the key
        existing: String,
    },

    /// Wildcard pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Compiler message
        message: String,
    },
}

/// Errors from one aggregation step
#[derive(Error, Debug)]
pub enum AggregationError {
    /// Reading inputs or writing outputs failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Metadata lookup failed
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// The level was asked to aggregate a window it cannot handle
    #[error("Invalid window {start}..{end}: {reason}")]
    InvalidWindow {
        /// Window start
        start: i64,
        /// Window end
        end: i64,
        /// Why it was rejected
        reason: String,
    },
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
