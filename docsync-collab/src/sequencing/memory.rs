//! In-process sequencing channel.
//!
//! Publishing appends to every current subscriber's queue while holding
//! the topic table lock, so all subscribers observe one total order.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{check_topic, ChannelError, SequencingChannel, Subscription};

#[derive(Default)]
pub struct InMemoryChannel {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl SequencingChannel for InMemoryChannel {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), ChannelError> {
        check_topic(topic)?;
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
        check_topic(topic)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(topic, rx))
    }
}
