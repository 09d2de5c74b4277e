//! # docsync-collab - storage, sequencing and realtime delivery
//!
//! Runs the document sync engine as a service, in one process or many.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   WebSocket    ┌──────────────┐
//! │ DocumentClient │ ◄────────────► │ SyncServer   │
//! └────────────────┘   JSON events  └──────┬───────┘
//!                                          │
//!                                ┌─────────▼──────────┐      ┌─────────────────┐
//!                                │ IngressCoordinator │ ◄──► │ SequencingChannel│
//!                                └─────────┬──────────┘      │ (relay, optional)│
//!                                          │                 └─────────────────┘
//!                                ┌─────────▼──────────┐
//!                                │ DocumentEngine     │ ──► SnapshotStore
//!                                └─────────┬──────────┘     (memory / RocksDB)
//!                                          │
//!                                ┌─────────▼──────────┐
//!                                │ FanoutRegistry     │ ──► local subscribers
//!                                └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: `SnapshotStore` trait with in-memory and RocksDB backends
//! - [`engine`]: serialized read-transform-write cycle per document
//! - [`sequencing`]: ordered topic: in-memory, relay client and relay server
//! - [`broadcast`]: per-process fan-out to joined connections
//! - [`coordinator`]: direct vs. sequenced ingress
//! - [`protocol`]: JSON event frames and operation validation
//! - [`server`]: realtime WebSocket server
//! - [`http`]: health and snapshot endpoints
//! - [`client`]: WebSocket client
//! - [`config`]: environment configuration

pub mod broadcast;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod http;
pub mod protocol;
pub mod sequencing;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{FanoutRegistry, FanoutStats, SubscriberHandle, Update};
pub use client::{ClientNotice, ConnectionState, DocumentClient};
pub use config::{ConfigError, ServerConfig};
pub use coordinator::{Ingress, IngressCoordinator, IngressError, IngressMode};
pub use engine::{DocumentEngine, EngineError, DEFAULT_MAX_APPLY_ATTEMPTS};
pub use protocol::{
    validate_operation, ClientEvent, ConflictNotice, ErrorNotice, ProtocolError, ServerEvent,
    ValidationDetails,
};
pub use sequencing::{
    ChannelError, InMemoryChannel, RelayChannel, RelayConfig, RelayStats, SequencerRelay,
    SequencingChannel, Subscription, DEFAULT_TOPIC,
};
pub use server::{ServerStats, SyncServer};
pub use storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};
