//! WebSocket endpoint of a sync node.
//!
//! Architecture:
//! ```text
//! Client A ──┐  request frames        ┌── RecordGateway ── RecordStore
//!            ├──────────────────────► │        │
//! Client B ──┘                        │        ├── FanOutHub ──► Client A, B, ...
//!      ▲                              │        └── CrossNodeRelay ──► other nodes
//!      └── response + change frames ──┘
//! ```
//!
//! Every connection is registered with the node's hub for its whole
//! lifetime and may issue `create` / `patch` / `page` / `ping` requests,
//! each answered by a response carrying the same `request_id`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use livegrid_core::NodeIdentity;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{HubStats, SubscriberInfo};
use crate::node::SyncNode;
use crate::protocol::{ClientRequest, RequestOp, ResponseBody, ServerMessage};
use crate::relay::{WsRelayTransport, DEFAULT_CHANNEL};
use crate::storage::{MemoryStore, RecordStore, RocksStore, StoreConfig, StoreError};
use crate::subscription::BackoffPolicy;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Change frames buffered per subscriber
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Relay server URL (None = standalone node)
    pub relay_url: Option<String>,
    pub relay_channel: String,
    /// Fixed node identity (None = generated at startup)
    pub node_id: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            relay_url: None,
            relay_channel: DEFAULT_CHANNEL.to_string(),
            node_id: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub relayed_in: u64,
    pub relayed_out: u64,
    pub relay_failures: u64,
    pub hub: HubStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

pub struct SyncServer {
    config: ServerConfig,
    node: Arc<SyncNode>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the configured store and assemble the node.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn RecordStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };

        let identity = config
            .node_id
            .clone()
            .map(NodeIdentity::new)
            .unwrap_or_else(NodeIdentity::generate);

        let mut node = SyncNode::new(identity, store, config.broadcast_capacity);
        if let Some(url) = &config.relay_url {
            node = node.with_relay(
                Arc::new(WsRelayTransport::new(url.clone())),
                config.relay_channel.clone(),
                config.backoff,
            );
        }
        Ok(Self::with_node(config, Arc::new(node)))
    }

    /// Serve an already assembled node.
    pub fn with_node(config: ServerConfig, node: Arc<SyncNode>) -> Self {
        Self {
            config,
            node,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Start listening for WebSocket connections.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Node {} listening on {}",
            self.node.identity(),
            self.config.bind_addr
        );
        self.serve(listener).await
    }

    /// Start the node and serve connections from `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        self.node.start();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let node = self.node.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, node, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        node: Arc<SyncNode>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut subscription = node.hub().register(SubscriberInfo::new(Some(addr)));

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.total_requests.fetch_add(1, Ordering::Relaxed);
                            let reply = match ClientRequest::decode(&text) {
                                Ok(request) => Self::dispatch(&node, request).await,
                                Err(e) => {
                                    log::warn!("Failed to decode request from {addr}: {e}");
                                    ServerMessage::response(0, ResponseBody::Error { message: e.to_string() })
                                }
                            };
                            if let ServerMessage::Response { body: ResponseBody::Error { .. }, .. } = &reply {
                                stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                            }
                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = subscription.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(frame.as_ref().clone().into())).await {
                                log::warn!("Dropping subscriber {addr}: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        drop(subscription);
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    async fn dispatch(node: &SyncNode, request: ClientRequest) -> ServerMessage {
        let body = match request.op {
            RequestOp::Create { data } => match node.create(data).await {
                Ok(record) => ResponseBody::Record { record },
                Err(e) => store_failure(e),
            },
            RequestOp::Patch { id, data } => match node.patch(id, &data).await {
                Ok(record) => ResponseBody::Record { record },
                Err(e) => store_failure(e),
            },
            RequestOp::Page { cursor, limit } => match node.page(cursor, limit) {
                Ok(page) => ResponseBody::Page { page },
                Err(e) => store_failure(e),
            },
            RequestOp::Ping => ResponseBody::Pong,
        };
        ServerMessage::response(request.request_id, body)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            relayed_in: self.node.relayed_in(),
            relayed_out: self.node.relayed_out(),
            relay_failures: self.node.relay_failures(),
            hub: self.node.hub().stats(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn node(&self) -> &Arc<SyncNode> {
        &self.node
    }
}

fn store_failure(e: StoreError) -> ResponseBody {
    match e {
        StoreError::NotFound(id) => ResponseBody::NotFound { id },
        other => {
            log::error!("Store error: {other}");
            ResponseBody::Error {
                message: other.to_string(),
            }
        }
    }
}
