//! Sequencing channel: one ordered broadcast topic shared by every server
//! process.
//!
//! ```text
//! process A ──publish──┐                      ┌──► process A subscription
//!                      ├──► ordering authority ┼──► process B subscription
//! process B ──publish──┘                      └──► process C subscription
//! ```
//!
//! Every subscriber sees every message, in the same order, including the
//! messages it published itself. Payloads are opaque strings (the JSON of a
//! `TextOperation`); there is no envelope, sequence number or replay. A
//! process that is not subscribed when a message goes out never sees it.
//!
//! Backends:
//! - [`InMemoryChannel`]: in-process ordered queue (tests, embedding)
//! - [`RelayChannel`]: client of a [`SequencerRelay`] over WebSocket

pub mod memory;
pub mod relay;
pub mod remote;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::InMemoryChannel;
pub use relay::{RelayConfig, RelayStats, SequencerRelay};
pub use remote::RelayChannel;

/// Topic used when none is configured.
pub const DEFAULT_TOPIC: &str = "workspace:ops";

/// Channel errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("sequencing channel unavailable: {0}")]
    Unavailable(String),
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),
}

/// Ordered stream of payloads from one topic.
///
/// Ends (`next` returns `None`) when the underlying link is gone.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Ordered, at-least-once publish/subscribe medium.
#[async_trait]
pub trait SequencingChannel: Send + Sync {
    /// Fire-and-forget publish. `Ok` means handed to the medium, not applied.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), ChannelError>;

    /// Start receiving every message published to `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError>;
}

/// Topics become a URL path segment on the relay.
pub(crate) fn check_topic(topic: &str) -> Result<(), ChannelError> {
    if topic.is_empty() || topic.contains('/') || topic.chars().any(char::is_whitespace) {
        return Err(ChannelError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}
