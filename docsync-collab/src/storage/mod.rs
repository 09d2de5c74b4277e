//! Snapshot storage backends.
//!
//! ```text
//! ┌────────────────┐   get / compare_and_set   ┌──────────────────────┐
//! │ DocumentEngine │ ────────────────────────► │ dyn SnapshotStore    │
//! └────────────────┘                           ├──────────────────────┤
//!                                              │ MemoryStore (HashMap)│
//!                                              │ RocksStore  (RocksDB)│
//!                                              └──────────────────────┘
//! ```
//!
//! Both backends create the default snapshot lazily on first `get` and
//! only ever replace a snapshot through `compare_and_set`, conditioned on
//! the version the caller read.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use docsync_core::DocumentSnapshot;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors. Any of these means nothing was written.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Authoritative `{content, version, updatedAt}` per document id.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Existing snapshot for `id`, or the freshly stored empty one.
    async fn get(&self, id: &str) -> Result<DocumentSnapshot, StoreError>;

    /// Replace the snapshot for `next.id` only if its stored version is
    /// still `expected_version`. Returns `false` when another writer won.
    async fn compare_and_set(
        &self,
        expected_version: u64,
        next: &DocumentSnapshot,
    ) -> Result<bool, StoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}
