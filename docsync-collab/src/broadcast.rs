//! Per-process fan-out of snapshots to locally connected subscribers.
//!
//! ```text
//! FanoutRegistry
//!   ├── "doc-a" ── DocumentRoom { sub 1 → outbox, sub 2 → outbox }
//!   └── "doc-b" ── DocumentRoom { sub 3 → outbox }
//! ```
//!
//! Each connection owns one bounded outbox shared by every room it has
//! joined. Delivery is best-effort: a full or closed outbox drops that
//! update (the subscriber resyncs on its next join). Per subscriber,
//! updates arrive in the order `broadcast_local` was called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use docsync_core::DocumentSnapshot;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// One applied change, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub snapshot: DocumentSnapshot,
    /// `clientId` of the operation that produced it
    pub origin_client: String,
    pub conflict: bool,
}

/// Subscriber side of a connection: id plus its outbox.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: Uuid,
    outbox: mpsc::Sender<Arc<Update>>,
}

impl SubscriberHandle {
    /// New handle and the receiver its connection drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<Update>>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                outbox,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
    pub active_subscribers: usize,
}

struct AtomicFanoutStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

#[derive(Default)]
struct DocumentRoom {
    subscribers: HashMap<Uuid, mpsc::Sender<Arc<Update>>>,
}

/// Maps document ids to their locally joined subscribers.
pub struct FanoutRegistry {
    rooms: RwLock<HashMap<String, DocumentRoom>>,
    stats: AtomicFanoutStats,
}

impl Default for FanoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats: AtomicFanoutStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register `subscriber` for `doc_id`. Returns false if already joined.
    pub fn join(&self, doc_id: &str, subscriber: &SubscriberHandle) -> bool {
        let mut rooms = self.rooms.write();
        let room = rooms.entry(doc_id.to_string()).or_default();
        room.subscribers
            .insert(subscriber.id, subscriber.outbox.clone())
            .is_none()
    }

    /// Unregister a subscriber from one document. Empty rooms are removed.
    pub fn leave(&self, doc_id: &str, subscriber_id: Uuid) -> bool {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get_mut(doc_id) else {
            return false;
        };
        let removed = room.subscribers.remove(&subscriber_id).is_some();
        if room.subscribers.is_empty() {
            rooms.remove(doc_id);
        }
        removed
    }

    /// Unregister a subscriber from every document. Returns rooms left.
    pub fn leave_all(&self, subscriber_id: Uuid) -> usize {
        let mut rooms = self.rooms.write();
        let mut left = 0;
        rooms.retain(|_, room| {
            if room.subscribers.remove(&subscriber_id).is_some() {
                left += 1;
            }
            !room.subscribers.is_empty()
        });
        left
    }

    /// Deliver `update` to every subscriber currently joined to `doc_id`.
    ///
    /// Returns the number of outboxes that accepted it.
    pub fn broadcast_local(&self, doc_id: &str, update: Update) -> usize {
        let update = Arc::new(update);
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let rooms = self.rooms.read();
            let Some(room) = rooms.get(doc_id) else {
                return 0;
            };
            for (id, outbox) in &room.subscribers {
                match outbox.try_send(update.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Subscriber {id} lagging on doc {doc_id}, update dropped");
                        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Closed(_)) => {
                        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        closed.push(*id);
                    }
                }
            }
        }

        for id in closed {
            log::debug!("Pruning closed subscriber {id} from doc {doc_id}");
            self.leave(doc_id, id);
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Number of subscribers joined to `doc_id`.
    pub fn subscriber_count(&self, doc_id: &str) -> usize {
        self.rooms
            .read()
            .get(doc_id)
            .map_or(0, |room| room.subscribers.len())
    }

    /// Whether `subscriber_id` is joined to `doc_id`.
    pub fn is_joined(&self, doc_id: &str, subscriber_id: Uuid) -> bool {
        self.rooms
            .read()
            .get(doc_id)
            .is_some_and(|room| room.subscribers.contains_key(&subscriber_id))
    }

    /// Number of documents with at least one local subscriber.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Ids of documents with at least one local subscriber.
    pub fn active_documents(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> FanoutStats {
        let rooms = self.rooms.read();
        FanoutStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            active_subscribers: rooms.values().map(|r| r.subscribers.len()).sum(),
        }
    }
}
