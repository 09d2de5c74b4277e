//! WebSocket client for a [`SequencerRelay`](super::SequencerRelay).
//!
//! One link per topic, opened lazily on first publish or subscribe. A link
//! carries both directions: frames we write are publishes, frames we read
//! are deliveries (our own publishes included) handed to every local
//! subscription. When the link drops, subscriptions end and publishes fail
//! with `ChannelError::Unavailable` until the next call reconnects.
//!
//! A publish also fails while the topic has no live local subscription on
//! the current link. The relay echoes every publish back to its sender, and
//! a process must see its own messages come back in order; an echo with
//! nowhere to go would be applied everywhere except here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use super::{check_topic, ChannelError, SequencingChannel, Subscription};

struct TopicLink {
    outgoing: mpsc::UnboundedSender<String>,
    subscribers: Arc<parking_lot::Mutex<Vec<mpsc::UnboundedSender<String>>>>,
    connected: Arc<AtomicBool>,
}

impl TopicLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Relay-backed sequencing channel.
pub struct RelayChannel {
    relay_url: String,
    links: Mutex<HashMap<String, Arc<TopicLink>>>,
}

impl RelayChannel {
    /// `relay_url` is the relay base, e.g. `ws://10.0.0.5:6380`.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into().trim_end_matches('/').to_string(),
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Whether the link for `topic` is currently up.
    pub async fn is_connected(&self, topic: &str) -> bool {
        self.links
            .lock()
            .await
            .get(topic)
            .is_some_and(|link| link.is_connected())
    }

    async fn link(&self, topic: &str) -> Result<Arc<TopicLink>, ChannelError> {
        check_topic(topic)?;
        let mut links = self.links.lock().await;
        if let Some(link) = links.get(topic) {
            if link.is_connected() {
                return Ok(link.clone());
            }
            log::info!("Relay link for topic {topic} is down, reconnecting");
        }

        let link = Arc::new(self.connect(topic).await?);
        links.insert(topic.to_string(), link.clone());
        Ok(link)
    }

    async fn connect(&self, topic: &str) -> Result<TopicLink, ChannelError> {
        let url = format!("{}/{}", self.relay_url, topic);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ChannelError::Unavailable(format!("{url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to sequencer relay {url}");

        let connected = Arc::new(AtomicBool::new(true));
        let subscribers: Arc<parking_lot::Mutex<Vec<mpsc::UnboundedSender<String>>>> =
            Arc::default();

        // Writer task: forward publishes to the relay
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                if ws_writer.send(Message::text(payload)).await.is_err() {
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        // Reader task: hand deliveries to local subscriptions
        let reader_connected = connected.clone();
        let reader_subscribers = subscribers.clone();
        let reader_topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let payload = text.as_str().to_string();
                        reader_subscribers
                            .lock()
                            .retain(|tx| tx.send(payload.clone()).is_ok());
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Ends every subscription on this link
            reader_subscribers.lock().clear();
            log::warn!("Relay link for topic {reader_topic} closed");
        });

        Ok(TopicLink {
            outgoing,
            subscribers,
            connected,
        })
    }
}

#[async_trait]
impl SequencingChannel for RelayChannel {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), ChannelError> {
        let link = self.link(topic).await?;
        // Held while queueing so the reader cannot end subscriptions in between
        let subscribers = link.subscribers.lock();
        if !subscribers.iter().any(|tx| !tx.is_closed()) {
            log::warn!("Refusing publish on {topic}: no local subscription to receive it");
            return Err(ChannelError::Unavailable(format!(
                "no local subscription on {topic}"
            )));
        }
        link.outgoing
            .send(payload)
            .map_err(|_| ChannelError::Unavailable(format!("relay link for {topic} closed")))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
        let link = self.link(topic).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        link.subscribers.lock().push(tx);
        Ok(Subscription::new(topic, rx))
    }
}
