//! Cross-node change relay.
//!
//! ```text
//!  node A                      relay channel "items"                node B
//! ┌────────┐  publish(event)  ┌────────────────────┐   Notify   ┌──────────┐
//! │ commit │ ───────────────► │ LocalBus  or       │ ─────────► │ listener │─► hub
//! └────────┘  origin = A      │ RelayServer (ws)   │            └──────────┘
//!      ▲                      └────────────────────┘
//!      └──── own Notify comes back too; dropped because origin == A
//! ```
//!
//! Publishing is fire-and-forget. Listening runs inside a
//! [`ResilientSubscription`], so a lost relay connection is retried with
//! backoff and never surfaces as an error to the node.

pub mod local;
pub mod server;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use livegrid_core::{ChangeEvent, NodeIdentity};
use thiserror::Error;

use crate::protocol::{ProtocolError, RelayFrame, RelayMessageType};
use crate::subscription::{BackoffPolicy, PayloadHandler, ResilientSubscription};
use crate::transport::{Connector, TransportError};

pub use local::LocalBus;
pub use server::{RelayConfig, RelayServer, RelayStats, RoomManager};
pub use ws::WsRelayTransport;

/// Default relay channel.
pub const DEFAULT_CHANNEL: &str = "items";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A shared broadcast medium carrying encoded [`RelayFrame`]s.
pub trait RelayTransport: Send + Sync + 'static {
    /// Connector whose connections yield every frame published on `channel`,
    /// the caller's own included.
    fn listener(&self, channel: &str) -> Arc<dyn Connector>;

    /// Hand a frame to the medium. Never waits for remote delivery.
    fn publish(&self, channel: &str, frame: Vec<u8>) -> BoxFuture<'_, Result<(), RelayError>>;
}

pub struct CrossNodeRelay {
    identity: NodeIdentity,
    transport: Arc<dyn RelayTransport>,
    channel: String,
    policy: BackoffPolicy,
    seq: AtomicU64,
}

impl CrossNodeRelay {
    pub fn new(
        identity: NodeIdentity,
        transport: Arc<dyn RelayTransport>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            transport,
            channel: channel.into(),
            policy: BackoffPolicy::default(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish `event`, tagged with its origin, on the relay channel.
    pub async fn publish(&self, event: &ChangeEvent) -> Result<(), RelayError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = RelayFrame::notify(&self.channel, seq, event)?.encode()?;
        self.transport.publish(&self.channel, frame).await?;
        log::trace!(
            "Relayed {} of record {} (seq {seq})",
            event.kind,
            event.record.id
        );
        Ok(())
    }

    /// Listen for events published by other nodes.
    ///
    /// Self-originated events are discarded before `handler` runs, as are
    /// frames that fail to decode. The returned subscription is not started.
    pub fn subscribe<F>(&self, handler: F) -> ResilientSubscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let identity = self.identity.clone();
        let channel = self.channel.clone();
        let on_payload: PayloadHandler = Arc::new(move |payload: Vec<u8>| {
            if let Some(event) = accept_frame(&identity, &channel, &payload) {
                handler(event);
            }
        });

        ResilientSubscription::new(
            format!("relay:{}", self.channel),
            self.transport.listener(&self.channel),
            on_payload,
            self.policy,
        )
    }
}

/// Decode one inbound relay payload into a foreign change event.
fn accept_frame(identity: &NodeIdentity, channel: &str, payload: &[u8]) -> Option<ChangeEvent> {
    let frame = match RelayFrame::decode(payload) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropping undecodable relay frame: {e}");
            return None;
        }
    };
    if frame.msg_type != RelayMessageType::Notify || frame.channel != channel {
        return None;
    }

    let event = match frame.change_event() {
        Ok(event) => event,
        Err(e) => {
            log::warn!("Dropping malformed change on '{channel}': {e}");
            return None;
        }
    };
    if identity.is_origin_of(&event) {
        log::trace!("Suppressed echo of record {} v{}", event.record.id, event.record.version);
        return None;
    }
    Some(event)
}
