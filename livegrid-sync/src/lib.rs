//! # livegrid-sync: Multi-node record synchronisation
//!
//! Serves a shared, versioned record table to many browser clients across
//! several server nodes, and keeps every client's view converged.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)   ┌─────────────┐     relay     ┌─────────────┐
//! │ SyncClient  │ ◄──────────────────► │ SyncServer  │ ◄───────────► │ SyncServer  │
//! │ RecordCache │  requests / changes  │ (node A)    │  bincode      │ (node B)    │
//! └─────────────┘                      └──────┬──────┘  frames       └──────┬──────┘
//!                                             │                             │
//!                                      ┌──────┴──────┐               ┌──────┴──────┐
//!                                      │ FanOutHub   │               │ FanOutHub   │
//!                                      └──────┬──────┘               └──────┬──────┘
//!                                             └──────── RecordStore ────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Relay frames (bincode) and client/server frames (JSON)
//! - [`storage`]: Record stores: RocksDB and in-memory
//! - [`gateway`]: Versioned create / patch / keyset paging
//! - [`transport`]: Connection seam and its WebSocket implementation
//! - [`subscription`]: Self-healing subscription with exponential backoff
//! - [`hub`]: Per-node fan-out to live subscribers
//! - [`relay`]: Cross-node relay: in-process bus, WebSocket broker and transport
//! - [`node`]: Gateway + hub + relay wired into one node
//! - [`server`]: WebSocket endpoint of a node
//! - [`client`]: WebSocket client with an optimistic record cache

pub mod protocol;
pub mod storage;
pub mod gateway;
pub mod transport;
pub mod subscription;
pub mod hub;
pub mod relay;
pub mod node;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ChangeNotice, ClientRequest, ProtocolError, RelayFrame, RelayMessageType, RequestOp,
    ResponseBody, ServerMessage,
};
pub use storage::{MemoryStore, RecordStore, RocksStore, StoreConfig, StoreError};
pub use gateway::{
    normalize_page_size, CommitHook, Page, RecordGateway, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use transport::{Connection, Connector, TransportError, WsConnection, WsConnector};
pub use subscription::{Backoff, BackoffPolicy, ResilientSubscription, SubscriptionState};
pub use hub::{FanOutHub, HubStats, HubSubscription, SubscriberInfo};
pub use relay::{
    CrossNodeRelay, LocalBus, RelayConfig, RelayError, RelayServer, RelayStats, RelayTransport,
    RoomManager, WsRelayTransport, DEFAULT_CHANNEL,
};
pub use node::SyncNode;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ClientError, RecordCommitSink, SyncClient, SyncEvent};
