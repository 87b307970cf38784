//! WebSocket sync client.
//!
//! Provides:
//! - A live feed kept alive by a [`ResilientSubscription`]; every change
//!   frame goes through the [`RecordCache`] reconciler
//! - Request/response calls (`create`, `update`, page loads) over a second,
//!   lazily (re)opened connection
//! - Optimistic edits: `update` shows the patch at once and settles it when
//!   the server answers
//!
//! ```text
//!   feed conn    ── change frames ──► apply_incoming ─┐
//!   request conn ── responses ──────► resolve / fail ─┼─► RecordCache ─► snapshot()
//!   update()     ── begin_edit ───────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use livegrid_core::{
    CacheError, CommitSink, MergeOutcome, Record, RecordCache, RecordData, RecordId,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientRequest, ProtocolError, RequestOp, ResponseBody, ServerMessage};
use crate::subscription::{BackoffPolicy, PayloadHandler, ResilientSubscription, SubscriptionState};
use crate::transport::{TransportError, WsConnector};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Node WebSocket URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    pub backoff: BackoffPolicy,
    /// How long a page load or ping waits for its response. Mutations wait
    /// until answered or until the connection drops.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A change (live feed, response or page row) altered the cache
    Merged { id: RecordId, outcome: MergeOutcome },
    /// Server state diverged from a local edit; a marker is attached
    Conflict { id: RecordId },
    /// A mutation request failed and its edit was rolled back
    MutationFailed { id: RecordId, reason: String },
    /// A page was merged
    PageLoaded { rows: usize, next_cursor: Option<RecordId> },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Record not found: {0}")]
    NotFound(RecordId),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Connection lost before the response arrived")]
    Disconnected,
    #[error("Unexpected response")]
    UnexpectedResponse,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>>;

/// Request connection: writer task fed by `outgoing`, reader task
/// completing `pending` by `request_id`.
struct RequestLink {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
}

impl RequestLink {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outgoing.is_closed()
    }

    async fn open(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing channel to WebSocket
        let writer_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(msg).await {
                    log::warn!("Request connection write failed: {e}");
                    break;
                }
            }
            writer_alive.store(false, Ordering::SeqCst);
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses to their callers
        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Request connection read failed: {e}");
                        break;
                    }
                };
                match ServerMessage::decode(&text) {
                    Ok(ServerMessage::Response { request_id, body }) => {
                        let waiter = reader_pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&request_id);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(body);
                            }
                            None => log::debug!("Response {request_id} has no waiter"),
                        }
                    }
                    // The live feed handles changes
                    Ok(ServerMessage::Change(_)) => {}
                    Err(e) => log::warn!("Undecodable frame on request connection: {e}"),
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            // Dropping the waiters fails their requests with `Disconnected`
            reader_pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });

        log::info!("Request connection opened to {url}");
        Ok(Self {
            outgoing,
            pending,
            alive,
        })
    }
}

pub struct SyncClient {
    config: ClientConfig,
    cache: Arc<RecordCache>,
    feed: ResilientSubscription,
    link: tokio::sync::Mutex<Option<RequestLink>>,
    /// Held across a whole page load so each page is fetched once
    page_load: tokio::sync::Mutex<()>,
    next_request: AtomicU64,
    event_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let cache = Arc::new(RecordCache::new());
        let (event_tx, event_rx) = mpsc::channel(256);

        let feed_cache = cache.clone();
        let feed_events = event_tx.clone();
        let handler: PayloadHandler = Arc::new(move |payload: Vec<u8>| {
            apply_feed_frame(&feed_cache, &feed_events, &payload);
        });
        let feed = ResilientSubscription::new(
            format!("feed:{}", config.url),
            Arc::new(WsConnector::new(config.url.clone())),
            handler,
            config.backoff,
        );

        Self {
            config,
            cache,
            feed,
            link: tokio::sync::Mutex::new(None),
            page_load: tokio::sync::Mutex::new(()),
            next_request: AtomicU64::new(1),
            event_rx: Mutex::new(Some(event_rx)),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Start the live feed. Must be called from within a tokio runtime.
    pub fn connect(&self) {
        self.feed.start();
    }

    /// Stop the live feed and drop the request connection.
    ///
    /// Delivery stops before this returns; in-flight requests fail with
    /// [`ClientError::Disconnected`].
    pub async fn disconnect(&self) {
        self.feed.shutdown().await;
        if self.link.lock().await.take().is_some() {
            log::info!("Request connection to {} closed", self.config.url);
        }
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn feed_state(&self) -> SubscriptionState {
        self.feed.state()
    }

    pub fn watch_feed_state(&self) -> tokio::sync::watch::Receiver<SubscriptionState> {
        self.feed.watch_state()
    }

    /// Fetch the page after the cache's cursor and merge it.
    ///
    /// Returns an empty list once the last page has been loaded.
    pub async fn load_next_page(&self, limit: Option<i64>) -> Result<Vec<MergeOutcome>, ClientError> {
        let _loading = self.page_load.lock().await;
        let snapshot = self.cache.snapshot();
        if snapshot.is_exhausted() {
            return Ok(Vec::new());
        }

        let op = RequestOp::Page {
            cursor: snapshot.next_cursor(),
            limit,
        };
        match self.request(op).await? {
            ResponseBody::Page { page } => {
                let rows = page.rows.len();
                let next_cursor = page.next_cursor;
                let outcomes = self.cache.merge_page(page.rows, page.next_cursor, page.total);
                self.emit(SyncEvent::PageLoaded { rows, next_cursor });
                Ok(outcomes)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn create(&self, data: RecordData) -> Result<Record, ClientError> {
        match self.request(RequestOp::Create { data }).await? {
            ResponseBody::Record { record } => {
                let outcome = self.cache.apply_incoming(record.clone());
                self.report(record.id, outcome);
                Ok(record)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Optimistically apply `patch` and send it.
    ///
    /// The cache shows the patched values immediately. A failed request
    /// rolls the edit back; a divergent answer leaves a conflict marker.
    pub async fn update(&self, id: RecordId, patch: RecordData) -> Result<Record, ClientError> {
        let ticket = self.cache.begin_edit(id, patch.clone())?;

        let result = match self.request(RequestOp::Patch { id, data: patch }).await {
            Ok(ResponseBody::Record { record }) => Ok(record),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        };

        match result {
            Ok(record) => {
                let outcome = self.cache.resolve_mutation_result(ticket, record.clone());
                self.report(id, outcome);
                Ok(record)
            }
            Err(e) => {
                self.cache.fail_mutation(ticket);
                log::warn!("Update of record {id} failed: {e}");
                self.emit(SyncEvent::MutationFailed {
                    id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Discard the local edit of `id` and adopt the server's version.
    pub fn resolve_conflict(&self, id: RecordId) -> Result<Record, ClientError> {
        let record = self.cache.resolve_conflict(id)?;
        self.emit(SyncEvent::Merged {
            id,
            outcome: MergeOutcome::Replaced,
        });
        Ok(record)
    }

    /// Round-trip a ping over the request connection.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.request(RequestOp::Ping).await? {
            ResponseBody::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, op: RequestOp) -> Result<ResponseBody, ClientError> {
        let deadline = match op {
            RequestOp::Page { .. } | RequestOp::Ping => Some(self.config.request_timeout),
            RequestOp::Create { .. } | RequestOp::Patch { .. } => None,
        };
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let text = ClientRequest { request_id, op }.encode()?;
        let (tx, rx) = oneshot::channel();

        let pending = {
            let mut link = self.link.lock().await;
            if !link.as_ref().is_some_and(RequestLink::is_alive) {
                *link = Some(RequestLink::open(&self.config.url).await?);
            }
            let link = link.as_ref().ok_or(ClientError::Disconnected)?;

            link.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(request_id, tx);
            if link.outgoing.send(Message::Text(text.into())).is_err() {
                link.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request_id);
                return Err(ClientError::Disconnected);
            }
            link.pending.clone()
        };

        let received = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(received) => received,
                Err(_) => {
                    pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&request_id);
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };
        let body = received.map_err(|_| ClientError::Disconnected)?;

        match body {
            ResponseBody::NotFound { id } => Err(ClientError::NotFound(id)),
            ResponseBody::Error { message } => Err(ClientError::Server(message)),
            body => Ok(body),
        }
    }

    fn report(&self, id: RecordId, outcome: MergeOutcome) {
        report_outcome(&self.event_tx, id, outcome);
    }

    fn emit(&self, event: SyncEvent) {
        emit(&self.event_tx, event);
    }
}

fn unexpected(body: ResponseBody) -> ClientError {
    log::warn!("Unexpected response: {body:?}");
    ClientError::UnexpectedResponse
}

fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = events.try_send(event) {
        log::trace!("Sync event not delivered: {e}");
    }
}

fn report_outcome(events: &mpsc::Sender<SyncEvent>, id: RecordId, outcome: MergeOutcome) {
    match outcome {
        MergeOutcome::Conflicted => emit(events, SyncEvent::Conflict { id }),
        MergeOutcome::Ignored => {}
        outcome => emit(events, SyncEvent::Merged { id, outcome }),
    }
}

/// Feed handler: reconcile one live change frame into the cache.
fn apply_feed_frame(cache: &RecordCache, events: &mpsc::Sender<SyncEvent>, payload: &[u8]) {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Dropping non-UTF-8 feed frame: {e}");
            return;
        }
    };
    match ServerMessage::decode(text) {
        Ok(ServerMessage::Change(notice)) => {
            let id = notice.record.id;
            let outcome = cache.apply_incoming(notice.record);
            log::trace!("Feed change for record {id}: {outcome:?}");
            report_outcome(events, id, outcome);
        }
        Ok(ServerMessage::Response { .. }) => {}
        Err(e) => log::warn!("Dropping malformed feed frame: {e}"),
    }
}

/// Commits a cell editor's values as `update` calls on one record.
pub struct RecordCommitSink {
    client: Arc<SyncClient>,
    id: RecordId,
}

impl RecordCommitSink {
    pub fn new(client: Arc<SyncClient>, id: RecordId) -> Self {
        Self { client, id }
    }
}

impl CommitSink for RecordCommitSink {
    fn commit(&self, field: &str, value: Value) {
        let mut patch = RecordData::new();
        patch.insert(field.to_string(), value);

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Cannot commit field '{field}' of record {}: {e}", self.id);
                return;
            }
        };
        let client = self.client.clone();
        let id = self.id;
        handle.spawn(async move {
            // Failures are reported through SyncEvent::MutationFailed
            let _ = client.update(id, patch).await;
        });
    }

    fn shown(&self, field: &str) -> Option<Value> {
        let snapshot = self.client.cache.snapshot();
        let record = snapshot.get(self.id)?.display();
        record.field(field).cloned()
    }
}
