//! Versioned Record Gateway: create, patch and cursor-paged reads over a
//! [`RecordStore`], with a post-commit hook that sees every successful
//! mutation exactly once.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use livegrid_core::{ChangeKind, Record, RecordData, RecordId};
use serde::{Deserialize, Serialize};

use crate::storage::{RecordStore, StoreError};

/// Page size used when the request names none (or an invalid one).
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Hard ceiling on rows per page, whatever the request asks for.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
///
/// Missing, zero and negative sizes fall back to [`DEFAULT_PAGE_SIZE`].
pub fn normalize_page_size(limit: Option<i64>) -> usize {
    match limit {
        Some(n) if n > 0 => n.min(MAX_PAGE_SIZE as i64) as usize,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// One page of records in ascending id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub rows: Vec<Record>,
    /// Id of the last row when the page was full, else `None`.
    pub next_cursor: Option<RecordId>,
    /// Total number of records in the store.
    pub total: u64,
}

/// Runs after a mutation has been committed to the store.
pub trait CommitHook: Send + Sync + 'static {
    fn on_commit(&self, kind: ChangeKind, record: &Record) -> BoxFuture<'_, ()>;
}

impl CommitHook for () {
    fn on_commit(&self, _kind: ChangeKind, _record: &Record) -> BoxFuture<'_, ()> {
        futures_util::future::ready(()).boxed()
    }
}

pub struct RecordGateway<H = ()> {
    store: Arc<dyn RecordStore>,
    hook: H,
}

impl RecordGateway<()> {
    /// Gateway without a commit hook.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_hook(store, ())
    }
}

impl<H: CommitHook> RecordGateway<H> {
    pub fn with_hook(store: Arc<dyn RecordStore>, hook: H) -> Self {
        Self { store, hook }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn create(&self, data: RecordData) -> Result<Record, StoreError> {
        let record = self.store.insert(data, Utc::now())?;
        log::debug!("Created record {}", record.id);
        self.hook.on_commit(ChangeKind::Created, &record).await;
        Ok(record)
    }

    /// Shallow-merge `patch` into record `id`.
    ///
    /// A `NotFound` result never reaches the commit hook.
    pub async fn patch(&self, id: RecordId, patch: &RecordData) -> Result<Record, StoreError> {
        let record = self.store.update(id, patch, Utc::now())?;
        log::debug!("Patched record {id} to v{}", record.version);
        self.hook.on_commit(ChangeKind::Updated, &record).await;
        Ok(record)
    }

    pub fn page(&self, cursor: Option<RecordId>, limit: Option<i64>) -> Result<Page, StoreError> {
        let size = normalize_page_size(limit);
        let rows = self.store.scan_after(cursor, size)?;
        let total = self.store.count()?;
        let next_cursor = if rows.len() == size {
            rows.last().map(|r| r.id)
        } else {
            None
        };
        Ok(Page {
            rows,
            next_cursor,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, RocksStore, StoreConfig};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        commits: Mutex<Vec<(ChangeKind, RecordId, u64)>>,
    }

    impl CommitHook for Arc<Recorder> {
        fn on_commit(&self, kind: ChangeKind, record: &Record) -> BoxFuture<'_, ()> {
            self.commits
                .lock()
                .unwrap()
                .push((kind, record.id, record.version));
            futures_util::future::ready(()).boxed()
        }
    }

    fn data(value: serde_json::Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    async fn seeded(store: Arc<dyn RecordStore>, n: usize) -> RecordGateway {
        let gateway = RecordGateway::new(store);
        for i in 0..n {
            gateway.create(data(json!({"n": i}))).await.unwrap();
        }
        gateway
    }

    fn assert_pagination_contract(gateway: &RecordGateway) {
        let first = gateway.page(None, Some(50)).unwrap();
        let ids: Vec<_> = first.rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());
        assert_eq!(first.next_cursor, Some(50));
        assert_eq!(first.total, 120);

        let second = gateway.page(Some(50), Some(50)).unwrap();
        assert_eq!(second.rows.first().map(|r| r.id), Some(51));
        assert_eq!(second.next_cursor, Some(100));

        let third = gateway.page(Some(100), Some(50)).unwrap();
        assert_eq!(third.rows.len(), 20);
        assert_eq!(third.next_cursor, None);

        let past_end = gateway.page(Some(120), Some(50)).unwrap();
        assert!(past_end.rows.is_empty());
        assert_eq!(past_end.next_cursor, None);
    }

    #[tokio::test]
    async fn test_pagination_contract_memory() {
        let gateway = seeded(Arc::new(MemoryStore::new()), 120).await;
        assert_pagination_contract(&gateway);
    }

    #[tokio::test]
    async fn test_pagination_contract_rocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let gateway = seeded(Arc::new(store), 120).await;
        assert_pagination_contract(&gateway);
    }

    #[tokio::test]
    async fn test_page_size_is_capped() {
        let gateway = seeded(Arc::new(MemoryStore::new()), 1005).await;
        let page = gateway.page(None, Some(5000)).unwrap();
        assert_eq!(page.rows.len(), MAX_PAGE_SIZE);
        assert_eq!(page.next_cursor, Some(1000));
    }

    #[test]
    fn test_normalize_page_size() {
        assert_eq!(normalize_page_size(None), DEFAULT_PAGE_SIZE);
        assert_eq!(normalize_page_size(Some(0)), DEFAULT_PAGE_SIZE);
        assert_eq!(normalize_page_size(Some(-3)), DEFAULT_PAGE_SIZE);
        assert_eq!(normalize_page_size(Some(7)), 7);
        assert_eq!(normalize_page_size(Some(1000)), 1000);
        assert_eq!(normalize_page_size(Some(i64::MAX)), MAX_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_hook_sees_each_commit_once() {
        let recorder = Arc::new(Recorder::default());
        let gateway = RecordGateway::with_hook(Arc::new(MemoryStore::new()), recorder.clone());

        let created = gateway.create(data(json!({"title": "A"}))).await.unwrap();
        gateway
            .patch(created.id, &data(json!({"title": "B"})))
            .await
            .unwrap();

        assert_eq!(
            recorder.commits.lock().unwrap().as_slice(),
            &[(ChangeKind::Created, 1, 1), (ChangeKind::Updated, 1, 2)]
        );
    }

    #[tokio::test]
    async fn test_patch_not_found_is_not_committed() {
        let recorder = Arc::new(Recorder::default());
        let gateway = RecordGateway::with_hook(Arc::new(MemoryStore::new()), recorder.clone());

        let result = gateway.patch(99, &data(json!({"title": "B"}))).await;
        assert_eq!(result, Err(StoreError::NotFound(99)));
        assert!(recorder.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_page_wire_shape() {
        let page = Page {
            rows: Vec::new(),
            next_cursor: None,
            total: 0,
        };
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value, json!({"rows": [], "nextCursor": null, "total": 0}));
    }
}
