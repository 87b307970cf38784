//! WebSocket relay broker.
//!
//! ```text
//! node A ──┐  Listen("items")          ┌── room "items" ── broadcast ──┬──► node A
//!          ├──────────────────────────►│                               ├──► node B
//! node B ──┘  Notify("items", event)   └── room "orders" ...           └──► node C
//! ```
//!
//! Nodes `Listen` / `Unlisten` on named channels; a `Notify` is forwarded
//! verbatim to every listener of its channel, the publisher included. The
//! broker never inspects the change event itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{RelayFrame, RelayMessageType};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per listener before it starts losing them
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_routed: u64,
    pub active_channels: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_routed: AtomicU64,
}

/// One named channel.
pub struct ChannelRoom {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    listeners: AtomicUsize,
}

impl ChannelRoom {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: AtomicUsize::new(0),
        }
    }

    fn join(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.listeners.fetch_add(1, Ordering::SeqCst);
        self.sender.subscribe()
    }

    fn leave(&self) {
        let _ = self
            .listeners
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Forward one encoded frame; returns the number of listeners reached.
    pub fn publish(&self, frame: Arc<Vec<u8>>) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }
}

/// Maps channel names to rooms.
///
/// Joining and leaving happen under the map's write lock, so a room is only
/// dropped while it has no listeners and a join never lands in a dropped room.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<ChannelRoom>>>,
    capacity: usize,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<ChannelRoom>> {
        self.rooms.read().await.get(channel).cloned()
    }

    /// Add a listener to `channel`, creating the room on first use.
    pub async fn join(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(ChannelRoom::new(self.capacity)))
            .join()
    }

    /// Remove one listener from `channel`; the room goes with its last one.
    ///
    /// Returns whether the room was removed.
    pub async fn leave(&self, channel: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(channel) else {
            return false;
        };
        room.leave();
        if room.listener_count() > 0 {
            return false;
        }
        rooms.remove(channel);
        log::debug!("Relay channel '{channel}' removed (empty)");
        true
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.channel_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New relay connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Relay connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<AtomicRelayStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Relay peer connected from {addr}");

        // Forwarders for every channel this peer listens on feed `out_tx`
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let mut listening: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let frame = match RelayFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode relay frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame.msg_type {
                                RelayMessageType::Listen => {
                                    if !listening.contains_key(&frame.channel) {
                                        let rx = rooms.join(&frame.channel).await;
                                        let forwarder = spawn_forwarder(rx, out_tx.clone());
                                        listening.insert(frame.channel.clone(), forwarder);
                                        log::debug!("{addr} listening on '{}'", frame.channel);
                                    }
                                }
                                RelayMessageType::Unlisten => {
                                    if let Some(forwarder) = listening.remove(&frame.channel) {
                                        forwarder.abort();
                                        rooms.leave(&frame.channel).await;
                                        log::debug!("{addr} stopped listening on '{}'", frame.channel);
                                    }
                                }
                                RelayMessageType::Notify => {
                                    if let Some(room) = rooms.get(&frame.channel).await {
                                        let reached = room.publish(Arc::new(bytes));
                                        stats.frames_routed.fetch_add(1, Ordering::Relaxed);
                                        log::trace!("Routed notify on '{}' to {reached} listeners", frame.channel);
                                    }
                                }
                                RelayMessageType::Ping => {
                                    let pong = RelayFrame::pong().encode()?;
                                    let _ = out_tx.send(Message::Binary(pong.into()));
                                }
                                RelayMessageType::Pong => {}
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Relay peer {addr} disconnected");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("Relay WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                Some(outgoing) = out_rx.recv() => {
                    if let Err(e) = ws_sender.send(outgoing).await {
                        log::warn!("Relay send to {addr} failed: {e}");
                        break;
                    }
                }
            }
        }

        for (channel, forwarder) in listening {
            forwarder.abort();
            rooms.leave(&channel).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_routed: self.stats.frames_routed.load(Ordering::Relaxed),
            active_channels: self.rooms.room_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    out_tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if out_tx.send(Message::Binary(frame.to_vec().into())).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Relay listener lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
