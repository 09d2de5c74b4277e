//! Realtime WebSocket server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── DocumentEngine ── SnapshotStore
//!             ├── connection ── IngressCoordinator ┤
//! Client B ──┘       ▲                           └── SequencingChannel (optional)
//!                    │
//!                    └──── outbox ◄── FanoutRegistry ◄── apply cycle
//! ```
//!
//! Each connection owns:
//! - one `SubscriberHandle` whose outbox is shared by every document it joins
//! - the set of `clientId`s it has submitted ops for, so a conflict is
//!   reported right after the submitter's own `document:updated`
//!
//! Frames are handled one at a time per connection. On disconnect the
//! connection leaves every document it joined.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::{SubscriberHandle, Update};
use crate::config::ServerConfig;
use crate::coordinator::{Ingress, IngressCoordinator, IngressError};
use crate::protocol::{
    reason, validate_operation, ClientEvent, ProtocolError, ServerEvent,
    CHANNEL_UNAVAILABLE_MESSAGE, MALFORMED_MESSAGE, STORE_UNAVAILABLE_MESSAGE,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub ops_applied: u64,
    pub ops_published: u64,
    pub conflicts: u64,
    pub errors: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    ops_applied: AtomicU64,
    ops_published: AtomicU64,
    conflicts: AtomicU64,
    errors: AtomicU64,
}

impl AtomicServerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-connection state.
struct Connection {
    subscriber: SubscriberHandle,
    /// clientIds this connection has submitted ops for
    submitted: HashSet<String>,
}

/// The realtime server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    coordinator: Arc<IngressCoordinator>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, coordinator: Arc<IngressCoordinator>) -> Self {
        Self {
            config: Arc::new(config),
            coordinator,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind `ws_addr` from the config and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(self.config.ws_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Realtime server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let config = self.config.clone();
            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, config, coordinator, stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        coordinator: Arc<IngressCoordinator>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), BoxError> {
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let origin = request
                    .headers()
                    .get("origin")
                    .and_then(|value| value.to_str().ok());
                if config.origin_allowed(origin) {
                    return Ok(response);
                }
                log::warn!("Rejected handshake from {addr}: origin {origin:?} not allowed");
                let mut reject = ErrorResponse::new(Some("origin not allowed".to_string()));
                *reject.status_mut() = StatusCode::FORBIDDEN;
                Err(reject)
            },
        )
        .await;
        let ws_stream = match handshake {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                AtomicServerStats::bump(&stats.rejected_connections);
                return Err(e.into());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (subscriber, mut outbox) = SubscriberHandle::channel(config.outbox_capacity);
        let mut conn = Connection {
            subscriber,
            submitted: HashSet::new(),
        };

        AtomicServerStats::bump(&stats.total_connections);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "WebSocket connection {} established from {addr}",
            conn.subscriber.id()
        );

        let result: Result<(), BoxError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            AtomicServerStats::bump(&stats.total_messages);
                            let text = text.as_str();
                            let replies =
                                Self::handle_frame(text, &mut conn, &coordinator, &stats).await;
                            if let Err(e) = send_all(&mut ws_sender, &replies).await {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            AtomicServerStats::bump(&stats.total_messages);
                            AtomicServerStats::bump(&stats.errors);
                            let reply =
                                ServerEvent::error(MALFORMED_MESSAGE, reason("binary frame"));
                            if let Err(e) = send_all(&mut ws_sender, &[reply]).await {
                                break Err(e);
                            }
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

                update = outbox.recv() => {
                    let Some(update) = update else {
                        break Ok(());
                    };
                    let events = Self::deliver(&update, &conn, &stats);
                    if let Err(e) = send_all(&mut ws_sender, &events).await {
                        break Err(e);
                    }
                }
            }
        };

        let left = coordinator.fanout().leave_all(conn.subscriber.id());
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!(
            "Connection {} from {addr} closed, left {left} document(s)",
            conn.subscriber.id()
        );
        result
    }

    /// Events for one inbound text frame, addressed to this connection only.
    async fn handle_frame(
        text: &str,
        conn: &mut Connection,
        coordinator: &IngressCoordinator,
        stats: &AtomicServerStats,
    ) -> Vec<ServerEvent> {
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Malformed frame from {}: {e}", conn.subscriber.id());
                AtomicServerStats::bump(&stats.errors);
                return vec![ServerEvent::error(MALFORMED_MESSAGE, reason(e))];
            }
        };

        match event {
            ClientEvent::Join(doc_id) => {
                coordinator.fanout().join(&doc_id, &conn.subscriber);
                match coordinator.engine().get(&doc_id).await {
                    Ok(snapshot) => {
                        log::debug!(
                            "{} joined doc {doc_id} at v{}",
                            conn.subscriber.id(),
                            snapshot.version
                        );
                        vec![ServerEvent::Updated(snapshot)]
                    }
                    Err(e) => {
                        log::error!("Join of doc {doc_id} failed: {e}");
                        AtomicServerStats::bump(&stats.errors);
                        vec![ServerEvent::error(STORE_UNAVAILABLE_MESSAGE, reason(e))]
                    }
                }
            }

            ClientEvent::Leave(doc_id) => {
                coordinator.fanout().leave(&doc_id, conn.subscriber.id());
                log::debug!("{} left doc {doc_id}", conn.subscriber.id());
                Vec::new()
            }

            ClientEvent::Op(raw) => {
                let op = match validate_operation(&raw) {
                    Ok(op) => op,
                    Err(ProtocolError::InvalidOperation(details)) => {
                        log::warn!("Rejected invalid op from {}", conn.subscriber.id());
                        AtomicServerStats::bump(&stats.errors);
                        return vec![ServerEvent::invalid_operation(&details)];
                    }
                    Err(e) => {
                        AtomicServerStats::bump(&stats.errors);
                        return vec![ServerEvent::error(MALFORMED_MESSAGE, reason(e))];
                    }
                };

                conn.submitted.insert(op.client_id.clone());
                let doc_id = op.doc_id.clone();

                match coordinator.receive(op).await {
                    Ok(Ingress::Applied(applied)) => {
                        AtomicServerStats::bump(&stats.ops_applied);
                        // A joined sender gets the conflict from its outbox, after the update
                        let joined = coordinator.fanout().is_joined(&doc_id, conn.subscriber.id());
                        if applied.conflict && !joined {
                            AtomicServerStats::bump(&stats.conflicts);
                            vec![ServerEvent::conflict(applied.snapshot)]
                        } else {
                            Vec::new()
                        }
                    }
                    Ok(Ingress::Published) => {
                        AtomicServerStats::bump(&stats.ops_published);
                        Vec::new()
                    }
                    Err(e) => {
                        log::error!("Op from {} failed: {e}", conn.subscriber.id());
                        AtomicServerStats::bump(&stats.errors);
                        let message = match e {
                            IngressError::StoreUnavailable(_) => STORE_UNAVAILABLE_MESSAGE,
                            IngressError::ChannelUnavailable(_) => CHANNEL_UNAVAILABLE_MESSAGE,
                            IngressError::SerializationError(_) | IngressError::NotSequenced => {
                                MALFORMED_MESSAGE
                            }
                        };
                        vec![ServerEvent::error(message, reason(e))]
                    }
                }
            }
        }
    }

    /// Events for one fanout delivery: the update, then a conflict if this
    /// connection submitted the op that caused it.
    fn deliver(update: &Update, conn: &Connection, stats: &AtomicServerStats) -> Vec<ServerEvent> {
        let mut events = vec![ServerEvent::Updated(update.snapshot.clone())];
        if update.conflict && conn.submitted.contains(&update.origin_client) {
            AtomicServerStats::bump(&stats.conflicts);
            events.push(ServerEvent::conflict(update.snapshot.clone()));
        }
        events
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let s = &self.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            rejected_connections: s.rejected_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            ops_applied: s.ops_applied.load(Ordering::Relaxed),
            ops_published: s.ops_published.load(Ordering::Relaxed),
            conflicts: s.conflicts.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<IngressCoordinator> {
        &self.coordinator
    }
}

async fn send_all<S>(sink: &mut S, events: &[ServerEvent]) -> Result<(), BoxError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for event in events {
        sink.send(Message::text(event.encode()?)).await?;
    }
    Ok(())
}
