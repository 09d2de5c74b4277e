//! Ingress coordinator: where an incoming operation goes next.
//!
//! ```text
//! Direct:     receive(op) ──► engine.apply ──► fanout.broadcast_local
//!
//! Sequenced:  receive(op) ──► channel.publish ──► (returns)
//!                                   │
//!             subscription ◄────────┘  (every process, same order)
//!                  │
//!                  └──► engine.apply ──► fanout.broadcast_local
//! ```
//!
//! The mode is chosen once at startup. A sequenced coordinator never
//! applies an operation it has not seen come back through the channel,
//! its own included, and a failed publish is an error rather than a
//! local apply.

use std::sync::Arc;
use std::time::Duration;

use docsync_core::{Applied, TextOperation};
use tokio::task::JoinHandle;

use crate::broadcast::{FanoutRegistry, Update};
use crate::engine::{DocumentEngine, EngineError};
use crate::sequencing::{ChannelError, SequencingChannel, Subscription};

const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(250);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How operations are applied on this process.
#[derive(Clone)]
pub enum IngressMode {
    /// One process owns the store: apply on receipt.
    Direct,
    /// Several processes: order everything through `channel` on `topic`.
    Sequenced {
        channel: Arc<dyn SequencingChannel>,
        topic: String,
    },
}

impl std::fmt::Debug for IngressMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngressMode::Direct => write!(f, "Direct"),
            IngressMode::Sequenced { topic, .. } => write!(f, "Sequenced({topic})"),
        }
    }
}

/// What `receive` did with an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingress {
    /// Applied and fanned out on this process.
    Applied(Applied),
    /// Handed to the sequencing channel; the result arrives via fanout.
    Published,
}

/// Ingress errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngressError {
    #[error(transparent)]
    StoreUnavailable(#[from] EngineError),
    #[error(transparent)]
    ChannelUnavailable(#[from] ChannelError),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("coordinator is not in sequenced mode")]
    NotSequenced,
}

pub struct IngressCoordinator {
    engine: Arc<DocumentEngine>,
    fanout: Arc<FanoutRegistry>,
    mode: IngressMode,
}

impl IngressCoordinator {
    pub fn new(
        engine: Arc<DocumentEngine>,
        fanout: Arc<FanoutRegistry>,
        mode: IngressMode,
    ) -> Self {
        log::info!("Ingress coordinator in {mode:?} mode");
        Self {
            engine,
            fanout,
            mode,
        }
    }

    pub fn direct(engine: Arc<DocumentEngine>, fanout: Arc<FanoutRegistry>) -> Self {
        Self::new(engine, fanout, IngressMode::Direct)
    }

    pub fn sequenced(
        engine: Arc<DocumentEngine>,
        fanout: Arc<FanoutRegistry>,
        channel: Arc<dyn SequencingChannel>,
        topic: impl Into<String>,
    ) -> Self {
        Self::new(
            engine,
            fanout,
            IngressMode::Sequenced {
                channel,
                topic: topic.into(),
            },
        )
    }

    pub fn mode(&self) -> &IngressMode {
        &self.mode
    }

    pub fn is_sequenced(&self) -> bool {
        matches!(self.mode, IngressMode::Sequenced { .. })
    }

    pub fn engine(&self) -> &Arc<DocumentEngine> {
        &self.engine
    }

    pub fn fanout(&self) -> &Arc<FanoutRegistry> {
        &self.fanout
    }

    /// Route one validated operation according to the mode.
    pub async fn receive(&self, op: TextOperation) -> Result<Ingress, IngressError> {
        match &self.mode {
            IngressMode::Direct => Ok(Ingress::Applied(self.apply_and_fanout(&op).await?)),
            IngressMode::Sequenced { channel, topic } => {
                let payload = serde_json::to_string(&op)
                    .map_err(|e| IngressError::SerializationError(e.to_string()))?;
                channel.publish(topic, payload).await?;
                log::debug!(
                    "Published op from {} on doc {} to {topic}",
                    op.client_id,
                    op.doc_id
                );
                Ok(Ingress::Published)
            }
        }
    }

    /// One full apply-then-fanout cycle. Fanout happens before the
    /// document lock is released.
    pub async fn apply_and_fanout(&self, op: &TextOperation) -> Result<Applied, EngineError> {
        let fanout = &self.fanout;
        self.engine
            .apply_then(op, |applied| {
                fanout.broadcast_local(
                    &op.doc_id,
                    Update {
                        snapshot: applied.snapshot.clone(),
                        origin_client: op.client_id.clone(),
                        conflict: applied.conflict,
                    },
                );
            })
            .await
    }

    /// Subscribe to the sequencing topic.
    pub async fn subscribe(&self) -> Result<Subscription, IngressError> {
        match &self.mode {
            IngressMode::Direct => Err(IngressError::NotSequenced),
            IngressMode::Sequenced { channel, topic } => Ok(channel.subscribe(topic).await?),
        }
    }

    /// Handle one sequenced message. Returns `None` when it was skipped.
    pub async fn process_sequenced(&self, payload: &str) -> Option<Applied> {
        let op: TextOperation = match serde_json::from_str(payload) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("Skipping undecodable sequenced payload: {e}");
                return None;
            }
        };

        match self.apply_and_fanout(&op).await {
            Ok(applied) => Some(applied),
            Err(e) => {
                log::error!(
                    "Failed to apply sequenced op from {} on doc {}: {e}",
                    op.client_id,
                    op.doc_id
                );
                None
            }
        }
    }

    /// Drain `subscription` strictly in delivery order until it ends.
    pub async fn drain(&self, mut subscription: Subscription) -> u64 {
        let mut processed = 0;
        while let Some(payload) = subscription.next().await {
            if self.process_sequenced(&payload).await.is_some() {
                processed += 1;
            }
        }
        processed
    }

    /// Subscribe now, then process the topic in the background, resubscribing
    /// with backoff whenever the subscription ends.
    ///
    /// The first subscribe happens before this returns, so operations
    /// published afterwards are not missed.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, IngressError> {
        let first = self.subscribe().await?;
        log::info!("Subscribed to sequencing topic {}", first.topic());

        let coordinator = self.clone();
        Ok(tokio::spawn(async move {
            let mut subscription = Some(first);
            let mut backoff = RESUBSCRIBE_BACKOFF_MIN;
            loop {
                if let Some(sub) = subscription.take() {
                    let topic = sub.topic().to_string();
                    let processed = coordinator.drain(sub).await;
                    log::warn!(
                        "Subscription to {topic} ended after {processed} ops, resubscribing"
                    );
                    backoff = RESUBSCRIBE_BACKOFF_MIN;
                }

                tokio::time::sleep(backoff).await;
                match coordinator.subscribe().await {
                    Ok(sub) => {
                        log::info!("Resubscribed to sequencing topic {}", sub.topic());
                        subscription = Some(sub);
                    }
                    Err(e) => {
                        log::error!("Resubscribe failed: {e}");
                        backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::SubscriberHandle;
    use crate::sequencing::InMemoryChannel;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    fn op(doc_id: &str, insert: &str, client_id: &str, base_version: u64) -> TextOperation {
        TextOperation {
            doc_id: doc_id.into(),
            position: 0,
            delete_count: 0,
            insert_text: insert.into(),
            client_id: client_id.into(),
            base_version,
        }
    }

    fn parts() -> (Arc<DocumentEngine>, Arc<FanoutRegistry>) {
        (
            Arc::new(DocumentEngine::new(Arc::new(MemoryStore::new()))),
            Arc::new(FanoutRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_direct_applies_and_fans_out() {
        let (engine, fanout) = parts();
        let (sub, mut rx) = SubscriberHandle::channel(8);
        fanout.join("doc", &sub);
        let coordinator = IngressCoordinator::direct(engine.clone(), fanout);

        let Ingress::Applied(applied) = coordinator.receive(op("doc", "hi", "a", 0)).await.unwrap()
        else {
            panic!("direct mode must apply");
        };
        assert_eq!(applied.snapshot.version, 1);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.snapshot, applied.snapshot);
        assert_eq!(update.origin_client, "a");
        assert!(!update.conflict);
        assert_eq!(engine.get("doc").await.unwrap().content, "hi");
    }

    #[tokio::test]
    async fn test_sequenced_does_not_apply_before_delivery() {
        let (engine, fanout) = parts();
        let channel = Arc::new(InMemoryChannel::new());
        let coordinator =
            IngressCoordinator::sequenced(engine.clone(), fanout, channel.clone(), "ops");
        let mut sub = coordinator.subscribe().await.unwrap();

        let result = coordinator.receive(op("doc", "hi", "a", 0)).await.unwrap();
        assert_eq!(result, Ingress::Published);
        assert_eq!(engine.get("doc").await.unwrap().version, 0);

        let payload = sub.next().await.unwrap();
        let applied = coordinator.process_sequenced(&payload).await.unwrap();
        assert_eq!(applied.snapshot.content, "hi");
        assert_eq!(engine.get("doc").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_sequenced_payload_is_plain_operation_json() {
        let (engine, fanout) = parts();
        let channel = Arc::new(InMemoryChannel::new());
        let mut raw = channel.subscribe("ops").await.unwrap();
        let coordinator = IngressCoordinator::sequenced(engine, fanout, channel.clone(), "ops");

        coordinator.receive(op("doc", "x", "a", 3)).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw.next().await.unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "docId": "doc",
                "position": 0,
                "deleteCount": 0,
                "insertText": "x",
                "clientId": "a",
                "baseVersion": 3
            })
        );
    }

    #[tokio::test]
    async fn test_undecodable_payload_skipped() {
        let (engine, fanout) = parts();
        let coordinator =
            IngressCoordinator::sequenced(
                engine.clone(),
                fanout,
                Arc::new(InMemoryChannel::new()),
                "ops",
            );
        assert!(coordinator.process_sequenced("{not json").await.is_none());
        assert!(coordinator.process_sequenced(r#"{"docId":"doc"}"#).await.is_none());
        assert_eq!(engine.get("doc").await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_two_processes_converge_in_channel_order() {
        let channel = Arc::new(InMemoryChannel::new());
        let (engine_a, fanout_a) = parts();
        let (engine_b, fanout_b) = parts();
        let a = Arc::new(IngressCoordinator::sequenced(
            engine_a.clone(),
            fanout_a.clone(),
            channel.clone(),
            "ops",
        ));
        let b = Arc::new(IngressCoordinator::sequenced(
            engine_b.clone(),
            fanout_b.clone(),
            channel.clone(),
            "ops",
        ));

        let (watch_a, mut rx_a) = SubscriberHandle::channel(64);
        let (watch_b, mut rx_b) = SubscriberHandle::channel(64);
        fanout_a.join("doc", &watch_a);
        fanout_b.join("doc", &watch_b);

        let handle_a = a.start().await.unwrap();
        let handle_b = b.start().await.unwrap();

        for i in 0..10 {
            let via = if i % 2 == 0 { &a } else { &b };
            via.receive(op("doc", &i.to_string(), "c", 0)).await.unwrap();
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for _ in 0..10 {
            seen_a.push(rx_a.recv().await.unwrap().snapshot.clone());
            seen_b.push(rx_b.recv().await.unwrap().snapshot.clone());
        }
        let contents = |seen: &[docsync_core::DocumentSnapshot]| {
            seen.iter().map(|s| (s.version, s.content.clone())).collect::<Vec<_>>()
        };
        assert_eq!(contents(&seen_a), contents(&seen_b));
        assert_eq!(seen_a.last().unwrap().content, "9876543210");
        assert_eq!(seen_a.last().unwrap().version, 10);

        handle_a.abort();
        handle_b.abort();
    }

    #[tokio::test]
    async fn test_conflict_flag_carried_to_fanout() {
        let channel = Arc::new(InMemoryChannel::new());
        let (engine, fanout) = parts();
        let coordinator = Arc::new(IngressCoordinator::sequenced(
            engine,
            fanout.clone(),
            channel,
            "ops",
        ));
        let (watch, mut rx) = SubscriberHandle::channel(8);
        fanout.join("doc", &watch);
        let handle = coordinator.start().await.unwrap();

        coordinator.receive(op("doc", "a", "first", 0)).await.unwrap();
        coordinator.receive(op("doc", "b", "stale", 0)).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.conflict);
        assert!(second.conflict);
        assert_eq!(second.origin_client, "stale");
        assert_eq!(second.snapshot.version, 2);

        handle.abort();
    }

    struct DeadChannel;

    #[async_trait]
    impl SequencingChannel for DeadChannel {
        async fn publish(&self, _topic: &str, _payload: String) -> Result<(), ChannelError> {
            Err(ChannelError::Unavailable("broker down".into()))
        }

        async fn subscribe(&self, _topic: &str) -> Result<Subscription, ChannelError> {
            Err(ChannelError::Unavailable("broker down".into()))
        }
    }

    #[tokio::test]
    async fn test_channel_failure_never_applies_directly() {
        let (engine, fanout) = parts();
        let coordinator =
            IngressCoordinator::sequenced(engine.clone(), fanout, Arc::new(DeadChannel), "ops");

        let result = coordinator.receive(op("doc", "x", "a", 0)).await;
        assert!(matches!(result, Err(IngressError::ChannelUnavailable(_))));
        assert_eq!(engine.get("doc").await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_start_requires_sequenced_mode() {
        let (engine, fanout) = parts();
        let coordinator = Arc::new(IngressCoordinator::direct(engine, fanout));
        assert!(matches!(
            coordinator.start().await,
            Err(IngressError::NotSequenced)
        ));
    }
}
