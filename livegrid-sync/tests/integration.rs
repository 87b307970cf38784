//! End-to-end tests: real nodes behind WebSocket servers, real clients.

use std::sync::Arc;

use livegrid_core::{DraftEditor, EditorKind, MergeOutcome, NodeIdentity, RecordData};
use livegrid_sync::client::{ClientConfig, ClientError, RecordCommitSink, SyncClient, SyncEvent};
use livegrid_sync::node::SyncNode;
use livegrid_sync::relay::{LocalBus, RelayTransport};
use livegrid_sync::server::{ServerConfig, SyncServer};
use livegrid_sync::storage::{MemoryStore, RecordStore};
use livegrid_sync::subscription::{BackoffPolicy, SubscriptionState};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

fn data(value: Value) -> RecordData {
    value.as_object().cloned().unwrap()
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        floor: Duration::from_millis(10),
        ceiling: Duration::from_millis(100),
        growth: 1.5,
    }
}

/// Serve `node` on a free port; returns its URL.
async fn serve_node(node: Arc<SyncNode>) -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::with_node(
        ServerConfig {
            bind_addr: addr.to_string(),
            ..ServerConfig::default()
        },
        node,
    ));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://{addr}"), server)
}

async fn start_standalone() -> (String, Arc<SyncServer>) {
    let node = SyncNode::new(
        NodeIdentity::new("solo"),
        Arc::new(MemoryStore::new()),
        64,
    );
    serve_node(Arc::new(node)).await
}

fn client_for(url: &str) -> SyncClient {
    let mut config = ClientConfig::new(url);
    config.backoff = fast_backoff();
    config.request_timeout = Duration::from_secs(2);
    SyncClient::new(config)
}

/// Connect the feed and wait until the server has registered it.
async fn connect_feed(client: &SyncClient, server: &SyncServer, subscribers: usize) {
    client.connect();
    let mut state = client.watch_feed_state();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SubscriptionState::Active),
    )
    .await
    .expect("feed should become active")
    .unwrap();

    timeout(Duration::from_secs(2), async {
        while server.node().hub().subscriber_count() < subscribers {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("server should register the feed");
}

async fn next_matching<F>(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event within timeout")
}

async fn wait_for_version(client: &SyncClient, id: u64, version: u64) {
    timeout(Duration::from_secs(2), async {
        loop {
            let shown = client.cache().snapshot().get(id).map(|r| r.display().version);
            if shown == Some(version) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cache should reach the expected version");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _server) = start_standalone().await;
    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_ping_roundtrip() {
    let (url, server) = start_standalone().await;
    let client = client_for(&url);
    client.ping().await.unwrap();
    assert_eq!(server.stats().total_requests, 1);
}

#[tokio::test]
async fn test_paging_120_rows_in_three_pages() {
    let (url, server) = start_standalone().await;
    let rows: Vec<RecordData> = (0..120).map(|i| data(json!({ "n": i }))).collect();
    server
        .node()
        .store()
        .insert_batch(rows, chrono::Utc::now())
        .unwrap();

    let client = client_for(&url);
    let mut events = client.take_event_rx().unwrap();

    let first = client.load_next_page(Some(50)).await.unwrap();
    assert_eq!(first.len(), 50);
    assert_eq!(client.cache().snapshot().next_cursor(), Some(50));
    assert_eq!(client.cache().snapshot().total(), 120);

    client.load_next_page(Some(50)).await.unwrap();
    let last = client.load_next_page(Some(50)).await.unwrap();
    assert_eq!(last.len(), 20);

    let snapshot = client.cache().snapshot();
    assert_eq!(snapshot.len(), 120);
    assert!(snapshot.is_exhausted());
    let ids: Vec<u64> = snapshot.rows().map(|r| r.id()).collect();
    assert_eq!(ids, (1..=120).collect::<Vec<_>>());

    // Exhausted: no further request
    let requests = server.stats().total_requests;
    assert!(client.load_next_page(Some(50)).await.unwrap().is_empty());
    assert_eq!(server.stats().total_requests, requests);

    let loaded = next_matching(&mut events, |e| {
        matches!(e, SyncEvent::PageLoaded { next_cursor: None, .. })
    })
    .await;
    assert_eq!(loaded, SyncEvent::PageLoaded { rows: 20, next_cursor: None });
}

#[tokio::test]
async fn test_concurrent_page_loads_fetch_distinct_pages() {
    let (url, server) = start_standalone().await;
    let rows: Vec<RecordData> = (0..40).map(|i| data(json!({ "n": i }))).collect();
    server
        .node()
        .store()
        .insert_batch(rows, chrono::Utc::now())
        .unwrap();

    let client = client_for(&url);
    let (first, second) = tokio::join!(
        client.load_next_page(Some(20)),
        client.load_next_page(Some(20))
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.len(), 20);
    assert_eq!(second.len(), 20);
    assert!(first.iter().chain(&second).all(|o| *o == MergeOutcome::Inserted));

    let snapshot = client.cache().snapshot();
    assert_eq!(snapshot.len(), 40);
    let ids: Vec<u64> = snapshot.rows().map(|r| r.id()).collect();
    assert_eq!(ids, (1..=40).collect::<Vec<_>>());
    assert_eq!(server.stats().total_requests, 2);
}

#[tokio::test]
async fn test_create_and_update_reach_other_client() {
    let (url, server) = start_standalone().await;
    let alice = client_for(&url);
    let bob = client_for(&url);
    let mut bob_events = bob.take_event_rx().unwrap();
    connect_feed(&bob, &server, 1).await;

    let created = alice.create(data(json!({"title": "A", "status": "open"}))).await.unwrap();
    assert_eq!(created.version, 1);

    next_matching(&mut bob_events, |e| {
        *e == SyncEvent::Merged { id: created.id, outcome: MergeOutcome::Inserted }
    })
    .await;

    let updated = alice.update(created.id, data(json!({"title": "B"}))).await.unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.field("status"), Some(&json!("open")));

    next_matching(&mut bob_events, |e| {
        *e == SyncEvent::Merged { id: created.id, outcome: MergeOutcome::Replaced }
    })
    .await;
    let seen = bob.cache().snapshot().get(created.id).unwrap().display();
    assert_eq!(seen.version, 2);
    assert_eq!(seen.field("title"), Some(&json!("B")));

    // Alice's cache holds the confirmed version with nothing pending
    let own = alice.cache().snapshot().get(created.id).cloned().unwrap();
    assert_eq!(own.confirmed().version, 2);
    assert!(own.pending().is_none());

    bob.disconnect().await;
}

#[tokio::test]
async fn test_update_unknown_record_is_not_found() {
    let (url, _server) = start_standalone().await;
    let client = client_for(&url);
    let created = client.create(data(json!({"title": "A"}))).await.unwrap();

    // Present in the cache but gone from the server's point of view
    let other = client_for(&url);
    let mut ghost = created;
    ghost.id = 999;
    other.cache().apply_incoming(ghost);

    let result = other.update(999, data(json!({"title": "x"}))).await;
    assert_eq!(result, Err(ClientError::NotFound(999)));
    let entry = other.cache().snapshot().get(999).cloned().unwrap();
    assert!(entry.pending().is_none());
    assert_eq!(entry.display().field("title"), Some(&json!("A")));
}

#[tokio::test]
async fn test_concurrent_edit_produces_conflict() {
    let (url, server) = start_standalone().await;
    let alice = client_for(&url);
    let bob = client_for(&url);
    let mut bob_events = bob.take_event_rx().unwrap();

    let created = alice.create(data(json!({"title": "A"}))).await.unwrap();
    bob.load_next_page(None).await.unwrap();
    connect_feed(&bob, &server, 1).await;

    // Bob starts editing; his request has not been sent yet
    let _ticket = bob
        .cache()
        .begin_edit(created.id, data(json!({"title": "Bob"})))
        .unwrap();
    alice.update(created.id, data(json!({"title": "Alice"}))).await.unwrap();

    next_matching(&mut bob_events, |e| *e == SyncEvent::Conflict { id: created.id }).await;
    let entry = bob.cache().snapshot().get(created.id).cloned().unwrap();
    assert_eq!(entry.display().field("title"), Some(&json!("Bob")));
    assert_eq!(entry.conflict().unwrap().server.field("title"), Some(&json!("Alice")));

    // Bob gives up his edit and takes the server's version
    let resolved = bob.resolve_conflict(created.id).unwrap();
    assert_eq!(resolved.version, 2);
    assert_eq!(resolved.field("title"), Some(&json!("Alice")));
    assert!(bob.cache().snapshot().conflicts().is_empty());

    bob.disconnect().await;
}

#[tokio::test]
async fn test_cell_editor_commits_through_client() {
    let (url, server) = start_standalone().await;
    let client = Arc::new(client_for(&url));
    let created = client.create(data(json!({"title": "A"}))).await.unwrap();

    let editor = DraftEditor::new(
        "title",
        EditorKind::FreeText,
        json!("A"),
        RecordCommitSink::new(client.clone(), created.id),
    )
    .with_quiet_period(Duration::from_millis(20));
    editor.begin();
    editor.keystroke(json!("AB")).unwrap();
    editor.keystroke(json!("ABC")).unwrap();

    // Shown optimistically once the debounce fires, confirmed after the round trip
    timeout(Duration::from_secs(2), async {
        loop {
            let page = server.node().page(None, None).unwrap();
            if page.rows[0].version == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("debounced commit should reach the server");

    let stored = &server.node().page(None, None).unwrap().rows[0];
    assert_eq!(stored.field("title"), Some(&json!("ABC")));
    assert_eq!(editor.committed(), json!("ABC"));
}

#[tokio::test]
async fn test_two_nodes_share_changes_through_relay() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let bus: Arc<dyn RelayTransport> = Arc::new(LocalBus::default());

    let node_a = Arc::new(
        SyncNode::new(NodeIdentity::new("node-a"), store.clone(), 64)
            .with_relay(bus.clone(), "items", fast_backoff()),
    );
    let node_b = Arc::new(
        SyncNode::new(NodeIdentity::new("node-b"), store, 64)
            .with_relay(bus, "items", fast_backoff()),
    );
    let (url_a, server_a) = serve_node(node_a.clone()).await;
    let (url_b, server_b) = serve_node(node_b.clone()).await;

    for node in [&node_a, &node_b] {
        let mut state = node.relay_subscription().unwrap().watch_state();
        timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SubscriptionState::Active),
        )
        .await
        .unwrap()
        .unwrap();
    }

    let on_a = client_for(&url_a);
    let on_b = client_for(&url_b);
    let mut a_events = on_a.take_event_rx().unwrap();
    let mut b_events = on_b.take_event_rx().unwrap();
    connect_feed(&on_a, &server_a, 1).await;
    connect_feed(&on_b, &server_b, 1).await;

    let created = on_a.create(data(json!({"title": "shared"}))).await.unwrap();

    next_matching(&mut b_events, |e| {
        *e == SyncEvent::Merged { id: created.id, outcome: MergeOutcome::Inserted }
    })
    .await;
    // Response and own feed echo race; only one of them inserts
    next_matching(&mut a_events, |e| {
        *e == SyncEvent::Merged { id: created.id, outcome: MergeOutcome::Inserted }
    })
    .await;

    let updated = on_b.update(created.id, data(json!({"title": "edited on b"}))).await.unwrap();
    assert_eq!(updated.version, 2);
    wait_for_version(&on_a, created.id, 2).await;
    let seen = on_a.cache().snapshot().get(created.id).unwrap().display();
    assert_eq!(seen.field("title"), Some(&json!("edited on b")));

    assert_eq!(node_a.relayed_in(), 1);
    assert_eq!(node_b.relayed_in(), 1);
    assert_eq!(server_a.stats().relayed_out, 1);

    on_a.disconnect().await;
    on_b.disconnect().await;
}
