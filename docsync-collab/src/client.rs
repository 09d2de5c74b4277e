//! WebSocket client for the realtime server.
//!
//! Provides:
//! - Connection lifecycle with background reader/writer tasks
//! - Join/leave and operation submission
//! - The last snapshot seen per document, so edits can carry a base version
//!
//! Server events are surfaced on the channel from [`DocumentClient::take_event_rx`].

use std::collections::HashMap;
use std::sync::Arc;

use docsync_core::{DocumentSnapshot, TextOperation};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    Connected,
    Disconnected,
    /// `document:updated`
    Updated(DocumentSnapshot),
    /// `document:conflict`: our op landed on a newer version than it was based on
    Conflict {
        message: String,
        snapshot: DocumentSnapshot,
    },
    /// `document:error`
    Error { message: String, details: Value },
}

type Snapshots = Arc<RwLock<HashMap<String, DocumentSnapshot>>>;

/// The document client.
pub struct DocumentClient {
    /// Attribution sent with every op
    client_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Latest snapshot received per document
    snapshots: Snapshots,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientNotice>>,
    event_tx: mpsc::Sender<ClientNotice>,
}

impl DocumentClient {
    pub fn new(client_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientNotice>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientNotice::Connected).await;

        // Reader task: decode server events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let snapshots = self.snapshots.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match ServerEvent::decode(text.as_str()) {
                            Ok(event) => event,
                            Err(e) => {
                                log::warn!("Ignoring undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let notice = match event {
                            ServerEvent::Updated(snapshot) => {
                                remember(&snapshots, &snapshot).await;
                                ClientNotice::Updated(snapshot)
                            }
                            ServerEvent::Conflict(notice) => {
                                remember(&snapshots, &notice.snapshot).await;
                                ClientNotice::Conflict {
                                    message: notice.message,
                                    snapshot: notice.snapshot,
                                }
                            }
                            ServerEvent::Error(notice) => ClientNotice::Error {
                                message: notice.message,
                                details: notice.details,
                            },
                        };
                        let _ = event_tx.send(notice).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientNotice::Disconnected).await;
        });

        Ok(())
    }

    /// Subscribe to a document. The server answers with its snapshot.
    pub async fn join(&self, doc_id: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Join(doc_id.to_string())).await
    }

    pub async fn leave(&self, doc_id: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Leave(doc_id.to_string())).await
    }

    /// Send an operation as-is.
    pub async fn submit(&self, op: &TextOperation) -> Result<(), ProtocolError> {
        let raw =
            serde_json::to_value(op).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        self.send(&ClientEvent::Op(raw)).await
    }

    /// Splice against the last snapshot seen for `doc_id`.
    pub async fn edit(
        &self,
        doc_id: &str,
        position: u64,
        delete_count: u64,
        insert_text: impl Into<String>,
    ) -> Result<TextOperation, ProtocolError> {
        let base_version = self.snapshot(doc_id).await.map_or(0, |s| s.version);
        let op = TextOperation {
            doc_id: doc_id.to_string(),
            position,
            delete_count,
            insert_text: insert_text.into(),
            client_id: self.client_id.clone(),
            base_version,
        };
        self.submit(&op).await?;
        Ok(op)
    }

    /// Replace the whole content of `doc_id`, as an editor does on save.
    pub async fn replace_content(
        &self,
        doc_id: &str,
        content: impl Into<String>,
    ) -> Result<TextOperation, ProtocolError> {
        let base = self
            .snapshot(doc_id)
            .await
            .unwrap_or_else(|| DocumentSnapshot::empty(doc_id));
        let op = TextOperation::replace_all(&base, self.client_id.clone(), content);
        self.submit(&op).await?;
        Ok(op)
    }

    async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = event.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Last snapshot received for `doc_id`.
    pub async fn snapshot(&self, doc_id: &str) -> Option<DocumentSnapshot> {
        self.snapshots.read().await.get(doc_id).cloned()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Keep the newest version; fanout can deliver an older one after a join reply.
async fn remember(snapshots: &Snapshots, snapshot: &DocumentSnapshot) {
    let mut known = snapshots.write().await;
    match known.get(&snapshot.id) {
        Some(current) if current.version > snapshot.version => {}
        _ => {
            known.insert(snapshot.id.clone(), snapshot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64, content: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            id: "doc".into(),
            content: content.into(),
            version,
            updated_at: 0,
        }
    }

    #[test]
    fn test_client_creation() {
        let client = DocumentClient::new("alice", "ws://localhost:4001");
        assert_eq!(client.client_id(), "alice");
        assert_eq!(client.server_url(), "ws://localhost:4001");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = DocumentClient::new("alice", "ws://localhost:4001");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.snapshot("doc").await.is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = DocumentClient::new("alice", "ws://localhost:4001");
        assert!(matches!(
            client.join("doc").await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(client.replace_content("doc", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = DocumentClient::new("alice", "ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = DocumentClient::new("alice", "ws://localhost:4001");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_remember_keeps_newest() {
        let snapshots: Snapshots = Arc::default();
        remember(&snapshots, &snapshot(3, "new")).await;
        remember(&snapshots, &snapshot(2, "old")).await;
        assert_eq!(snapshots.read().await["doc"].content, "new");
        remember(&snapshots, &snapshot(4, "newer")).await;
        assert_eq!(snapshots.read().await["doc"].version, 4);
    }
}
