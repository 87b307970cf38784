//! One server process: gateway + local fan-out hub + cross-node relay.
//!
//! ```text
//!  create / patch ──► RecordGateway ──► store
//!                          │ on_commit (origin = this node)
//!                          ├──► FanOutHub.broadcast ──► local subscribers
//!                          └──► CrossNodeRelay.publish ──► other nodes
//!
//!  relay listener ──(foreign origin only)──► FanOutHub.broadcast
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use livegrid_core::{ChangeEvent, ChangeKind, NodeIdentity, Record, RecordData, RecordId};

use crate::gateway::{CommitHook, Page, RecordGateway};
use crate::hub::FanOutHub;
use crate::relay::{CrossNodeRelay, RelayTransport};
use crate::storage::{RecordStore, StoreError};
use crate::subscription::{BackoffPolicy, ResilientSubscription, SubscriptionState};

#[derive(Default)]
struct NodeCounters {
    relayed_in: AtomicU64,
    relayed_out: AtomicU64,
    relay_failures: AtomicU64,
}

/// Post-commit hook: local fan-out first, then the relay.
pub struct NodeHook {
    identity: NodeIdentity,
    hub: Arc<FanOutHub>,
    relay: Option<Arc<CrossNodeRelay>>,
    counters: Arc<NodeCounters>,
}

impl CommitHook for NodeHook {
    fn on_commit(&self, kind: ChangeKind, record: &Record) -> BoxFuture<'_, ()> {
        let event = ChangeEvent {
            kind,
            record: record.clone(),
            origin: self.identity.clone(),
        };
        async move {
            let reached = self.hub.broadcast(&event);
            log::debug!(
                "Record {} {kind} v{} fanned out to {reached} subscribers",
                event.record.id,
                event.record.version
            );

            if let Some(relay) = &self.relay {
                match relay.publish(&event).await {
                    Ok(()) => {
                        self.counters.relayed_out.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.relay_failures.fetch_add(1, Ordering::Relaxed);
                        log::error!("Relay publish failed for record {}: {e}", event.record.id);
                    }
                }
            }
        }
        .boxed()
    }
}

pub struct SyncNode {
    identity: NodeIdentity,
    gateway: RecordGateway<NodeHook>,
    hub: Arc<FanOutHub>,
    listener: Option<ResilientSubscription>,
    counters: Arc<NodeCounters>,
}

impl SyncNode {
    /// A standalone node; changes reach only its own subscribers.
    pub fn new(identity: NodeIdentity, store: Arc<dyn RecordStore>, hub_capacity: usize) -> Self {
        let hub = Arc::new(FanOutHub::new(hub_capacity));
        let counters = Arc::new(NodeCounters::default());
        let hook = NodeHook {
            identity: identity.clone(),
            hub: hub.clone(),
            relay: None,
            counters: counters.clone(),
        };
        Self {
            identity,
            gateway: RecordGateway::with_hook(store, hook),
            hub,
            listener: None,
            counters,
        }
    }

    /// Join a relay channel shared with other nodes.
    pub fn with_relay(
        mut self,
        transport: Arc<dyn RelayTransport>,
        channel: impl Into<String>,
        policy: BackoffPolicy,
    ) -> Self {
        let relay = Arc::new(
            CrossNodeRelay::new(self.identity.clone(), transport, channel).with_backoff(policy),
        );

        let hub = self.hub.clone();
        let counters = self.counters.clone();
        let listener = relay.subscribe(move |event| {
            counters.relayed_in.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Relayed {} of record {} from {}",
                event.kind,
                event.record.id,
                event.origin
            );
            hub.broadcast(&event);
        });

        let hook = NodeHook {
            identity: self.identity.clone(),
            hub: self.hub.clone(),
            relay: Some(relay),
            counters: self.counters.clone(),
        };
        self.gateway = RecordGateway::with_hook(self.gateway.store().clone(), hook);
        self.listener = Some(listener);
        self
    }

    /// Start listening on the relay (no-op without one).
    pub fn start(&self) {
        if let Some(listener) = &self.listener {
            listener.start();
        }
        log::info!("Node {} started", self.identity);
    }

    /// Stop the relay listener and release its connection.
    pub async fn shutdown(&self) {
        if let Some(listener) = &self.listener {
            listener.shutdown().await;
        }
        log::info!("Node {} stopped", self.identity);
    }

    pub async fn create(&self, data: RecordData) -> Result<Record, StoreError> {
        self.gateway.create(data).await
    }

    pub async fn patch(&self, id: RecordId, patch: &RecordData) -> Result<Record, StoreError> {
        self.gateway.patch(id, patch).await
    }

    pub fn page(&self, cursor: Option<RecordId>, limit: Option<i64>) -> Result<Page, StoreError> {
        self.gateway.page(cursor, limit)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn hub(&self) -> &Arc<FanOutHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.gateway.store()
    }

    pub fn relay_subscription(&self) -> Option<&ResilientSubscription> {
        self.listener.as_ref()
    }

    pub fn relay_state(&self) -> Option<SubscriptionState> {
        self.listener.as_ref().map(ResilientSubscription::state)
    }

    /// Foreign events received over the relay.
    pub fn relayed_in(&self) -> u64 {
        self.counters.relayed_in.load(Ordering::Relaxed)
    }

    /// Own events handed to the relay.
    pub fn relayed_out(&self) -> u64 {
        self.counters.relayed_out.load(Ordering::Relaxed)
    }

    pub fn relay_failures(&self) -> u64 {
        self.counters.relay_failures.load(Ordering::Relaxed)
    }
}
