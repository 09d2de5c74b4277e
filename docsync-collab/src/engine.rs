//! Read-transform-write cycle against the snapshot store.
//!
//! ```text
//! op ──► lock(doc_id) ──► store.get ──► apply() ──► store.compare_and_set ──► unlock
//!                              ▲                            │ lost
//!                              └────────── re-read ◄────────┘
//! ```
//!
//! Operations on one document id are serialized by a per-document lock;
//! different ids proceed independently. The compare-and-set write keeps a
//! second writer on the same store from being silently overwritten.

use std::collections::HashMap;
use std::sync::Arc;

use docsync_core::{apply, Applied, DocumentSnapshot, TextOperation};
use tokio::sync::{Mutex, RwLock};

use crate::storage::{SnapshotStore, StoreError};

/// Default bound on compare-and-set retries per operation.
pub const DEFAULT_MAX_APPLY_ATTEMPTS: usize = 8;

/// Engine errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("document {doc_id} kept changing under {attempts} apply attempts")]
    Contended { doc_id: String, attempts: usize },
}

/// Applies operations to the store one document at a time.
pub struct DocumentEngine {
    store: Arc<dyn SnapshotStore>,
    /// doc_id → lock held for a whole apply cycle
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    max_apply_attempts: usize,
}

impl DocumentEngine {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            locks: RwLock::new(HashMap::new()),
            max_apply_attempts: DEFAULT_MAX_APPLY_ATTEMPTS,
        }
    }

    /// Override the compare-and-set retry bound (minimum 1).
    pub fn with_max_apply_attempts(mut self, attempts: usize) -> Self {
        self.max_apply_attempts = attempts.max(1);
        self
    }

    /// Current snapshot, created with defaults if absent.
    pub async fn get(&self, doc_id: &str) -> Result<DocumentSnapshot, EngineError> {
        Ok(self.store.get(doc_id).await?)
    }

    /// Apply one operation to its document and persist the result.
    pub async fn apply(&self, op: &TextOperation) -> Result<Applied, EngineError> {
        self.apply_then(op, |_| {}).await
    }

    /// Like [`apply`](Self::apply), running `after` on the stored result
    /// before the document lock is released. Fan-out goes here so
    /// subscribers see updates in the order they were written.
    pub async fn apply_then<F>(&self, op: &TextOperation, after: F) -> Result<Applied, EngineError>
    where
        F: FnOnce(&Applied),
    {
        let lock = self.lock_for(&op.doc_id).await;
        let result = {
            let _held = lock.lock().await;
            self.apply_locked(op, after).await
        };
        drop(lock);
        self.release_lock(&op.doc_id).await;
        result
    }

    /// The store this engine writes to.
    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Number of documents with a live lock entry.
    pub async fn lock_count(&self) -> usize {
        self.locks.read().await.len()
    }

    async fn apply_locked<F>(&self, op: &TextOperation, after: F) -> Result<Applied, EngineError>
    where
        F: FnOnce(&Applied),
    {
        for attempt in 1..=self.max_apply_attempts {
            let current = self.store.get(&op.doc_id).await?;
            let applied = apply(&current, op);
            if self
                .store
                .compare_and_set(current.version, &applied.snapshot)
                .await?
            {
                if applied.conflict {
                    log::debug!(
                        "Conflict on doc {}: client {} based on v{}, applied at v{}",
                        op.doc_id,
                        op.client_id,
                        op.base_version,
                        current.version
                    );
                }
                after(&applied);
                return Ok(applied);
            }
            log::warn!(
                "Lost compare-and-set on doc {} at v{} (attempt {attempt})",
                op.doc_id,
                current.version
            );
        }

        Err(EngineError::Contended {
            doc_id: op.doc_id.clone(),
            attempts: self.max_apply_attempts,
        })
    }

    async fn lock_for(&self, doc_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(doc_id) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry for `doc_id` once no task holds or waits on it.
    async fn release_lock(&self, doc_id: &str) {
        let mut locks = self.locks.write().await;
        if locks.get(doc_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(doc_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn op(doc_id: &str, position: u64, insert: &str, base_version: u64) -> TextOperation {
        TextOperation {
            doc_id: doc_id.into(),
            position,
            delete_count: 0,
            insert_text: insert.into(),
            client_id: "tester".into(),
            base_version,
        }
    }

    fn engine() -> DocumentEngine {
        DocumentEngine::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_apply_persists() {
        let engine = engine();
        let out = engine.apply(&op("doc", 0, "hello", 0)).await.unwrap();
        assert_eq!(out.snapshot.version, 1);
        assert!(!out.conflict);

        let stored = engine.get("doc").await.unwrap();
        assert_eq!(stored, out.snapshot);
    }

    #[tokio::test]
    async fn test_join_then_get_stable() {
        let engine = engine();
        let joined = engine.get("new-doc").await.unwrap();
        assert_eq!(joined.content, "");
        assert_eq!(joined.version, 0);
        assert_eq!(engine.get("new-doc").await.unwrap(), joined);
    }

    #[tokio::test]
    async fn test_concurrent_ops_same_doc_serialized() {
        let engine = Arc::new(engine());
        let mut handles = Vec::new();
        for i in 0..50 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.apply(&op("busy", 0, "x", i)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snap = engine.get("busy").await.unwrap();
        assert_eq!(snap.version, 50);
        assert_eq!(snap.content, "x".repeat(50));
        assert_eq!(engine.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_lock_entries_released_after_apply() {
        let engine = engine();
        for doc in ["a", "b", "c"] {
            engine.apply(&op(doc, 0, "x", 0)).await.unwrap();
        }
        assert_eq!(engine.lock_count().await, 0);

        // A held entry survives until its holder is done
        let held = engine.lock_for("a").await;
        engine.apply(&op("a", 0, "y", 1)).await.unwrap();
        assert_eq!(engine.lock_count().await, 1);
        drop(held);
        engine.apply(&op("a", 0, "z", 2)).await.unwrap();
        assert_eq!(engine.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_apply_then_runs_once_with_stored_result() {
        let engine = engine();
        let mut seen = Vec::new();
        let out = engine
            .apply_then(&op("doc", 0, "hi", 0), |a| seen.push(a.snapshot.version))
            .await
            .unwrap();
        assert_eq!(seen, vec![out.snapshot.version]);
    }

    #[tokio::test]
    async fn test_stale_base_reports_conflict() {
        let engine = engine();
        engine.apply(&op("doc", 0, "a", 0)).await.unwrap();
        engine.apply(&op("doc", 1, "b", 1)).await.unwrap();
        let out = engine.apply(&op("doc", 0, "c", 0)).await.unwrap();
        assert!(out.conflict);
        assert_eq!(out.snapshot.content, "cab");
        assert_eq!(out.snapshot.version, 3);
    }

    /// Store whose first `losses` compare-and-sets fail as if another
    /// process had written in between.
    struct RacingStore {
        inner: MemoryStore,
        losses: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotStore for RacingStore {
        async fn get(&self, id: &str) -> Result<DocumentSnapshot, StoreError> {
            self.inner.get(id).await
        }

        async fn compare_and_set(
            &self,
            expected_version: u64,
            next: &DocumentSnapshot,
        ) -> Result<bool, StoreError> {
            if self.losses.load(Ordering::SeqCst) > 0 {
                self.losses.fetch_sub(1, Ordering::SeqCst);
                // The competing write lands first
                let current = self.inner.get(&next.id).await?;
                let rival = DocumentSnapshot {
                    content: format!("{}R", current.content),
                    version: current.version + 1,
                    ..current.clone()
                };
                self.inner.compare_and_set(current.version, &rival).await?;
                return Ok(false);
            }
            self.inner.compare_and_set(expected_version, next).await
        }

        fn backend(&self) -> &'static str {
            "racing"
        }
    }

    #[tokio::test]
    async fn test_lost_write_is_reapplied_not_overwritten() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            losses: AtomicUsize::new(1),
        });
        let engine = DocumentEngine::new(store);

        let out = engine.apply(&op("doc", 99, "L", 0)).await.unwrap();
        // The rival write survives and ours lands on top of it
        assert_eq!(out.snapshot.content, "RL");
        assert_eq!(out.snapshot.version, 2);
        assert!(out.conflict);
    }

    #[tokio::test]
    async fn test_contended_after_max_attempts() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            losses: AtomicUsize::new(10),
        });
        let engine = DocumentEngine::new(store).with_max_apply_attempts(3);

        match engine.apply(&op("doc", 0, "x", 0)).await {
            Err(EngineError::Contended { doc_id, attempts }) => {
                assert_eq!(doc_id, "doc");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Contended, got {other:?}"),
        }
    }

    struct DownStore;

    #[async_trait]
    impl SnapshotStore for DownStore {
        async fn get(&self, _id: &str) -> Result<DocumentSnapshot, StoreError> {
            Err(StoreError::DatabaseError("connection refused".into()))
        }

        async fn compare_and_set(
            &self,
            _expected_version: u64,
            _next: &DocumentSnapshot,
        ) -> Result<bool, StoreError> {
            Err(StoreError::DatabaseError("connection refused".into()))
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let engine = DocumentEngine::new(Arc::new(DownStore));
        assert!(matches!(
            engine.apply(&op("doc", 0, "x", 0)).await,
            Err(EngineError::StoreUnavailable(_))
        ));
        assert!(matches!(
            engine.get("doc").await,
            Err(EngineError::StoreUnavailable(_))
        ));
    }
}
