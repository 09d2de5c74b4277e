//! Sequencer relay: the single ordering authority for multi-process
//! deployments.
//!
//! ```text
//! ws://relay/<topic>
//!
//! conn A ──text──┐                                   ┌──► conn A
//!                ├──► dispatcher (one task, FIFO) ───┼──► conn B
//! conn B ──text──┘                                   └──► conn C
//! ```
//!
//! A connection subscribes to the topic named by its URL path. Every text
//! frame it sends is published to that topic; every publish on the topic is
//! written back to all of its connections, the sender included. Payloads are
//! relayed untouched. One dispatcher task handles every publish, so all
//! subscribers observe one order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::check_topic;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:6380".to_string(),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub published: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    published: AtomicU64,
}

#[derive(Debug)]
enum Command {
    Subscribe {
        topic: String,
        id: Uuid,
        tx: mpsc::UnboundedSender<Arc<str>>,
    },
    Unsubscribe {
        topic: String,
        id: Uuid,
    },
    Publish {
        topic: String,
        payload: Arc<str>,
    },
}

/// The relay server.
pub struct SequencerRelay {
    config: RelayConfig,
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<AtomicRelayStats>,
}

impl SequencerRelay {
    /// Create the relay and start its dispatcher. Needs a tokio runtime.
    pub fn new(config: RelayConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch(rx));
        Self {
            config,
            commands,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and accept connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sequencer relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New relay connection from {addr}");

            let commands = self.commands.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, commands, stats).await {
                    log::error!("Relay connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn dispatch(mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut topics: HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<Arc<str>>>> =
            HashMap::new();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Subscribe { topic, id, tx } => {
                    topics.entry(topic).or_default().insert(id, tx);
                }
                Command::Unsubscribe { topic, id } => {
                    if let Some(subs) = topics.get_mut(&topic) {
                        subs.remove(&id);
                        if subs.is_empty() {
                            topics.remove(&topic);
                        }
                    }
                }
                Command::Publish { topic, payload } => {
                    if let Some(subs) = topics.get_mut(&topic) {
                        subs.retain(|_, tx| tx.send(payload.clone()).is_ok());
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        commands: mpsc::UnboundedSender<Command>,
        stats: Arc<AtomicRelayStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut topic = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let requested = request.uri().path().trim_start_matches('/');
                if check_topic(requested).is_err() {
                    let message = format!("invalid topic {requested:?}");
                    let mut reject = ErrorResponse::new(Some(message));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    return Err(reject);
                }
                topic = requested.to_string();
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let id = Uuid::new_v4();
        let (tx, mut deliveries) = mpsc::unbounded_channel();
        commands.send(Command::Subscribe {
            topic: topic.clone(),
            id,
            tx,
        })?;

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Relay subscriber {id} joined topic {topic}");

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let payload: Arc<str> = Arc::from(text.as_str());
                            let publish = Command::Publish { topic: topic.clone(), payload };
                            if commands.send(publish).is_err() {
                                break Ok(());
                            }
                            stats.published.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Err(e)) => break Err(e.into()),
                        _ => {}
                    }
                }

                delivery = deliveries.recv() => {
                    match delivery {
                        Some(payload) => {
                            let frame = Message::text(payload.to_string());
                            if let Err(e) = ws_sender.send(frame).await {
                                break Err(e.into());
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        let _ = commands.send(Command::Unsubscribe {
            topic: topic.clone(),
            id,
        });
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Relay subscriber {id} left topic {topic}");
        result
    }

    /// Get relay statistics.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
