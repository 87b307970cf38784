//! Resilient subscription: connect, listen, detect failure, back off,
//! reconnect. Shared by the cross-node relay listener and the client's
//! live feed.
//!
//! ```text
//!                 start()
//!  Disconnected ──────────► Connecting ──(connected)──► Active
//!       ▲                    ▲      │                    │
//!       │                    │      │ connect error      │ error / close
//!       │       timer fires  │      ▼                    │
//!       │                    └── Backoff ◄───────────────┘
//!       │
//!  any state ──stop()──► Stopped ──start()──► Connecting (backoff reset)
//! ```
//!
//! Backoff delays start at the floor, grow ×1.5 per consecutive failure and
//! are capped at the ceiling; an established connection resets them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::transport::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Active,
    Backoff,
    Stopped,
}

impl SubscriptionState {
    /// True while a connection loop is running.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SubscriptionState::Connecting | SubscriptionState::Active | SubscriptionState::Backoff
        )
    }
}

/// Reconnect delay parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
    pub growth: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(1000),
            ceiling: Duration::from_millis(30_000),
            growth: 1.5,
        }
    }
}

/// Delay generator for consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.floor,
        }
    }

    /// Delay before the next attempt: `min(floor · growth^(k-1), ceiling)`
    /// for the k-th consecutive failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.policy.ceiling);
        let growth = if self.policy.growth.is_finite() {
            self.policy.growth.max(1.0)
        } else {
            1.0
        };
        self.current = delay.mul_f64(growth).min(self.policy.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.floor;
    }
}

/// Receives each inbound payload of an active connection.
pub type PayloadHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

struct Shared {
    name: String,
    connector: Arc<dyn Connector>,
    handler: PayloadHandler,
    policy: BackoffPolicy,
    state: watch::Sender<SubscriptionState>,
    last_delay: Mutex<Option<Duration>>,
    failures: AtomicU64,
}

impl Shared {
    /// Move to `next` unless this run has been stopped.
    fn transition(&self, gate: &AtomicBool, next: SubscriptionState) {
        self.state.send_if_modified(|state| {
            if !gate.load(Ordering::SeqCst) || *state == next {
                return false;
            }
            log::trace!("Subscription '{}': {:?} -> {:?}", self.name, state, next);
            *state = next;
            true
        });
    }
}

struct Run {
    stop_tx: watch::Sender<bool>,
    /// Cleared synchronously by `stop()`; payloads are only delivered while set.
    gate: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Run {
    fn halt(&self) {
        self.gate.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }
}

/// A self-healing subscription owned by its creator.
pub struct ResilientSubscription {
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl ResilientSubscription {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        handler: PayloadHandler,
        policy: BackoffPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                connector,
                handler,
                policy,
                state,
                last_delay: Mutex::new(None),
                failures: AtomicU64::new(0),
            }),
            run: Mutex::new(None),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin connecting. No-op while already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut run = self.lock_run();
        if self.state().is_running() {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let gate = Arc::new(AtomicBool::new(true));
        self.shared.state.send_replace(SubscriptionState::Connecting);
        log::debug!("Subscription '{}' starting", self.shared.name);

        let task = tokio::spawn(run_loop(self.shared.clone(), stop_rx, gate.clone()));
        *run = Some(Run {
            stop_tx,
            gate,
            task: Some(task),
        });
    }

    /// Stop delivering immediately and wind the connection down.
    ///
    /// The backoff timer is cancelled and an active connection is closed
    /// (unsubscribing first) by the background task.
    pub fn stop(&self) {
        let run = self.lock_run();
        if let Some(run) = run.as_ref() {
            run.halt();
        }
        let previous = self.shared.state.send_replace(SubscriptionState::Stopped);
        if previous != SubscriptionState::Stopped {
            log::debug!("Subscription '{}' stopped", self.shared.name);
        }
    }

    /// `stop()` and wait for the connection to be released.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.lock_run().as_mut().and_then(|run| run.task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.shared.state.subscribe()
    }

    /// Delay chosen for the most recent backoff.
    pub fn last_delay(&self) -> Option<Duration> {
        *self
            .shared
            .last_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect failures plus dropped connections since creation.
    pub fn failure_count(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }
}

impl Drop for ResilientSubscription {
    fn drop(&mut self) {
        if let Some(run) = self.lock_run().as_ref() {
            run.halt();
        }
    }
}

async fn run_loop(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>, gate: Arc<AtomicBool>) {
    let mut backoff = Backoff::new(shared.policy);

    loop {
        shared.transition(&gate, SubscriptionState::Connecting);
        let attempt = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            attempt = shared.connector.connect() => attempt,
        };

        match attempt {
            Ok(mut conn) => {
                shared.transition(&gate, SubscriptionState::Active);
                backoff.reset();
                log::info!("Subscription '{}' connected", shared.name);

                let failure = loop {
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break None,
                        next = conn.recv() => match next {
                            Some(Ok(payload)) => {
                                if gate.load(Ordering::SeqCst) {
                                    (shared.handler)(payload);
                                }
                            }
                            Some(Err(e)) => break Some(e.to_string()),
                            None => break Some("closed by peer".to_string()),
                        },
                    }
                };

                match failure {
                    None => {
                        conn.close().await;
                        break;
                    }
                    Some(reason) => {
                        log::warn!("Subscription '{}' lost: {reason}", shared.name);
                    }
                }
            }
            Err(e) => {
                log::warn!("Subscription '{}' connect failed: {e}", shared.name);
            }
        }

        shared.failures.fetch_add(1, Ordering::Relaxed);
        let delay = backoff.next_delay();
        *shared
            .last_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
        shared.transition(&gate, SubscriptionState::Backoff);
        log::debug!("Subscription '{}' retrying in {delay:?}", shared.name);

        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    log::debug!("Subscription '{}' loop exited", shared.name);
}
