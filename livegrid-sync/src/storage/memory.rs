//! In-memory record store, used when no storage path is configured.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use livegrid_core::{Record, RecordData, RecordId};

use super::{RecordStore, StoreError};

#[derive(Default)]
struct Inner {
    records: BTreeMap<RecordId, Record>,
    last_id: RecordId,
}

/// Process-local store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for MemoryStore {
    fn insert(&self, data: RecordData, now: DateTime<Utc>) -> Result<Record, StoreError> {
        let mut inner = self.lock();
        inner.last_id += 1;
        let record = Record::new_created(inner.last_id, data, now);
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn update(
        &self,
        id: RecordId,
        patch: &RecordData,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError> {
        let mut inner = self.lock();
        let current = inner.records.get(&id).ok_or(StoreError::NotFound(id))?;
        let next = current.patched(patch, now);
        inner.records.insert(id, next.clone());
        Ok(next)
    }

    fn scan_after(&self, cursor: Option<RecordId>, limit: usize) -> Result<Vec<Record>, StoreError> {
        let inner = self.lock();
        let start = match cursor {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Unbounded,
        };
        Ok(inner
            .records
            .range((start, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().records.len() as u64)
    }
}
