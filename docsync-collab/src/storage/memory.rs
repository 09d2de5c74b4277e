//! In-process snapshot table.
//!
//! Valid as the authority only while exactly one server process exists.
//! Constructed once and handed to every component that needs it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docsync_core::DocumentSnapshot;
use tokio::sync::RwLock;

use super::{SnapshotStore, StoreError};

/// HashMap-backed store.
#[derive(Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<String, DocumentSnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents created so far.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<DocumentSnapshot, StoreError> {
        // Fast path: read lock
        {
            let documents = self.documents.read().await;
            if let Some(snapshot) = documents.get(id) {
                return Ok(snapshot.clone());
            }
        }

        // Slow path: a concurrent get may have created it meanwhile
        let mut documents = self.documents.write().await;
        let snapshot = documents
            .entry(id.to_string())
            .or_insert_with(|| DocumentSnapshot::empty(id));
        Ok(snapshot.clone())
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        next: &DocumentSnapshot,
    ) -> Result<bool, StoreError> {
        let mut documents = self.documents.write().await;
        let current_version = documents.get(&next.id).map_or(0, |s| s.version);
        if current_version != expected_version {
            return Ok(false);
        }
        documents.insert(next.id.clone(), next.clone());
        Ok(true)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
