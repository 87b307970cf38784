//! Local fan-out of change events to this node's live subscribers.
//!
//! Every change is encoded once into a client `change` frame and pushed
//! through a tokio broadcast channel; each subscriber owns an independent
//! receiver buffering up to `capacity` frames. A subscriber that falls
//! further behind loses the oldest frames (counted as dropped) instead of
//! slowing everyone else down.
//!
//! Ordering is FIFO per subscriber; there is no ordering across
//! subscribers and no replay for late joiners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use livegrid_core::ChangeEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Encoded `change` frame shared by all receivers.
pub type Frame = Arc<String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Who is listening.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberInfo {
    pub id: Uuid,
    pub addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

impl SubscriberInfo {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            connected_at: Utc::now(),
        }
    }
}

pub struct FanOutHub {
    sender: broadcast::Sender<Frame>,
    subscribers: RwLock<HashMap<Uuid, SubscriberInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl FanOutHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add a subscriber. Dropping the returned handle unregisters it.
    pub fn register(self: &Arc<Self>, info: SubscriberInfo) -> HubSubscription {
        let id = info.id;
        let rx = self.sender.subscribe();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, info);
        log::debug!("Hub subscriber {id} registered");
        HubSubscription {
            id,
            rx,
            hub: Arc::clone(self),
        }
    }

    pub fn unregister(&self, id: &Uuid) -> Option<SubscriberInfo> {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            log::debug!("Hub subscriber {id} unregistered");
        }
        removed
    }

    /// Push a change to every open subscriber.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let frame = match ServerMessage::change(event).encode() {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                log::error!("Failed to encode change for record {}: {e}", event.record.id);
                return 0;
            }
        };
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}

/// One subscriber's receive side.
pub struct HubSubscription {
    id: Uuid,
    rx: broadcast::Receiver<Frame>,
    hub: Arc<FanOutHub>,
}

impl HubSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next frame in publish order, skipping over frames lost to lag.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.hub.messages_dropped.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Hub subscriber {} lagged by {n} messages", self.id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for HubSubscription {
    fn drop(&mut self) {
        self.hub.unregister(&self.id);
    }
}
