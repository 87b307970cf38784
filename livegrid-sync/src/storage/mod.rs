//! Durable record storage.
//!
//! ```text
//! ┌───────────────┐   insert / update / scan_after / count
//! │ RecordGateway │ ─────────────────────────────────────────┐
//! └───────────────┘                                          ▼
//!                                   ┌──────────────────────────────────┐
//!                                   │ dyn RecordStore                  │
//!                                   │  ├── MemoryStore (BTreeMap)      │
//!                                   │  └── RocksStore                  │
//!                                   │       CF "records" (LZ4 JSON)    │
//!                                   │       CF "meta"    (next id)     │
//!                                   └──────────────────────────────────┘
//! ```
//!
//! A store owns id assignment and the version increment: `update` reads,
//! merges and writes back as one atomic step, so two concurrent patches of
//! the same record always yield two distinct versions.

pub mod memory;
pub mod rocks;

use chrono::{DateTime, Utc};
use livegrid_core::{Record, RecordData, RecordId};
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend failure
    #[error("Database error: {0}")]
    DatabaseError(String),
    /// No record with this id
    #[error("Record not found: {0}")]
    NotFound(RecordId),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::SerializationError(e.to_string())
    }
}

/// A durable, versioned record set.
pub trait RecordStore: Send + Sync {
    /// Persist a new record at version 1 with a fresh id.
    fn insert(&self, data: RecordData, now: DateTime<Utc>) -> Result<Record, StoreError>;

    /// Shallow-merge `patch` into record `id`, bump its version and set
    /// `updated_at = now`. Returns [`StoreError::NotFound`] for unknown ids.
    fn update(
        &self,
        id: RecordId,
        patch: &RecordData,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError>;

    /// Up to `limit` records with `id > cursor`, ascending by id.
    fn scan_after(&self, cursor: Option<RecordId>, limit: usize) -> Result<Vec<Record>, StoreError>;

    /// Total number of records.
    fn count(&self) -> Result<u64, StoreError>;

    /// Insert several records. Stores with batched writes override this.
    fn insert_batch(
        &self,
        rows: Vec<RecordData>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError> {
        rows.into_iter().map(|data| self.insert(data, now)).collect()
    }
}
