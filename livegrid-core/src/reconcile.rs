//! Optimistic merge reconciler for the client-side record cache.
//!
//! Local edits are shown immediately and remembered as a [`PendingPatch`]
//! anchored to the version they were based on. Every authoritative state
//! that reaches the client (a mutation response or a live change event)
//! is reconciled against that intent:
//!
//! ```text
//!                 ┌──────────── pending? ────────────┐
//!                 │ no                               │ yes
//!                 ▼                                  ▼
//!     incoming.version >= cached?        patched fields all match?
//!        yes → replace                     yes → replace, clear pending
//!        no  → ignore (stale)              no  → newer than base?
//!                                                  yes → ConflictMarker
//!                                                  no  → ignore (stale)
//! ```
//!
//! The cache is an immutable [`CacheSnapshot`] behind an `Arc`. Every
//! operation is a copy-on-write replacement of the whole snapshot, so a
//! reader holding a snapshot never observes a half-applied merge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::record::{Record, RecordData, RecordId};

/// Errors returned by cache operations that need an existing entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("record {0} is not in the cache")]
    UnknownRecord(RecordId),
    #[error("record {0} has no conflict to resolve")]
    NoConflict(RecordId),
    #[error("edit patch is empty")]
    EmptyPatch,
}

/// A local edit that has not been confirmed by the server yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatch {
    /// Version the client believed current when the first edit started.
    pub base_version: u64,
    /// Field values the client intends to write.
    pub patch: RecordData,
    /// Edit that last wrote each field.
    owners: HashMap<String, u64>,
    latest_edit: u64,
}

impl PendingPatch {
    fn new(base_version: u64, patch: RecordData, edit: u64) -> Self {
        let owners = patch.keys().map(|field| (field.clone(), edit)).collect();
        Self {
            base_version,
            patch,
            owners,
            latest_edit: edit,
        }
    }

    /// Overwrite field values; the base version never moves forward.
    fn supersede(&mut self, patch: RecordData, edit: u64) {
        for (field, value) in patch {
            self.owners.insert(field.clone(), edit);
            self.patch.insert(field, value);
        }
        self.latest_edit = edit;
    }

    /// Drop the fields last written by `edit`. Returns true if any were dropped.
    fn withdraw(&mut self, edit: u64) -> bool {
        let withdrawn: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == edit)
            .map(|(field, _)| field.clone())
            .collect();
        for field in &withdrawn {
            self.owners.remove(field);
            self.patch.remove(field);
        }
        !withdrawn.is_empty()
    }
}

/// Server snapshot that disagrees with an in-flight local edit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictMarker {
    pub server: Record,
}

/// One cache entry: the last confirmed server row plus local intent.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord {
    confirmed: Record,
    pending: Option<PendingPatch>,
    conflict: Option<ConflictMarker>,
}

impl CachedRecord {
    fn new(confirmed: Record) -> Self {
        Self {
            confirmed,
            pending: None,
            conflict: None,
        }
    }

    pub fn id(&self) -> RecordId {
        self.confirmed.id
    }

    /// What the UI shows: the confirmed row with pending edits overlaid.
    pub fn display(&self) -> Record {
        match &self.pending {
            Some(pending) => self.confirmed.overlaid(&pending.patch),
            None => self.confirmed.clone(),
        }
    }

    pub fn confirmed(&self) -> &Record {
        &self.confirmed
    }

    pub fn pending(&self) -> Option<&PendingPatch> {
        self.pending.as_ref()
    }

    pub fn conflict(&self) -> Option<&ConflictMarker> {
        self.conflict.as_ref()
    }

    pub fn has_conflict(&self) -> bool {
        self.conflict.is_some()
    }

    /// Reconcile an authoritative row against the pending edit (if any).
    fn reconcile(&mut self, incoming: Record) -> MergeOutcome {
        let Some(pending) = &self.pending else {
            return self.accept_if_current(incoming);
        };

        if incoming.matches_patch(&pending.patch) {
            self.confirmed = incoming;
            self.pending = None;
            self.conflict = None;
            return MergeOutcome::Replaced;
        }

        if incoming.version > pending.base_version {
            let newer_than_marker = self
                .conflict
                .as_ref()
                .map_or(true, |marker| incoming.version >= marker.server.version);
            if newer_than_marker {
                log::debug!(
                    "Conflict on record {} (server v{}, local edit based on v{})",
                    incoming.id,
                    incoming.version,
                    pending.base_version
                );
                self.conflict = Some(ConflictMarker { server: incoming });
                return MergeOutcome::Conflicted;
            }
        }

        MergeOutcome::Ignored
    }

    /// Last-writer-wins by version; ties are accepted so re-delivery is harmless.
    fn accept_if_current(&mut self, incoming: Record) -> MergeOutcome {
        if incoming.version >= self.confirmed.version {
            self.confirmed = incoming;
            if self.pending.is_none() {
                self.conflict = None;
            }
            MergeOutcome::Replaced
        } else {
            MergeOutcome::Ignored
        }
    }
}

/// Handle identifying one `begin_edit` call, used to resolve its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditTicket {
    pub id: RecordId,
    pub edit: u64,
}

/// Result of reconciling one authoritative state or outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Unknown id, added to the cache.
    Inserted,
    /// Authoritative state adopted.
    Replaced,
    /// Server state disagrees with local intent; marker attached.
    Conflicted,
    /// Stale or duplicate state; cache unchanged.
    Ignored,
    /// Failed mutation undone.
    RolledBack,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        self != MergeOutcome::Ignored
    }
}

/// Immutable view of the cache at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    records: HashMap<RecordId, CachedRecord>,
    order: Vec<RecordId>,
    next_cursor: Option<RecordId>,
    total: u64,
    exhausted: bool,
}

impl CacheSnapshot {
    pub fn get(&self, id: RecordId) -> Option<&CachedRecord> {
        self.records.get(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries in display order.
    pub fn rows(&self) -> impl Iterator<Item = &CachedRecord> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Ids of entries currently carrying a conflict marker.
    pub fn conflicts(&self) -> Vec<RecordId> {
        self.rows()
            .filter(|entry| entry.has_conflict())
            .map(CachedRecord::id)
            .collect()
    }

    /// Cursor for the next page fetch (last id of the last loaded page).
    pub fn next_cursor(&self) -> Option<RecordId> {
        self.next_cursor
    }

    /// Total row count reported by the last page fetch.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// True once a short page has been loaded.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn insert_front(&mut self, record: Record) {
        self.order.insert(0, record.id);
        self.records.insert(record.id, CachedRecord::new(record));
    }

    fn insert_back(&mut self, record: Record) {
        self.order.push(record.id);
        self.records.insert(record.id, CachedRecord::new(record));
    }
}

/// Shared, snapshot-swapping record cache.
#[derive(Debug, Default)]
pub struct RecordCache {
    state: Mutex<Arc<CacheSnapshot>>,
    next_edit: AtomicU64,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Later mutations never alter it.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read-modify-write on the snapshot; copies only if a reader holds it.
    fn mutate<R>(&self, f: impl FnOnce(&mut CacheSnapshot) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }

    /// Start (or extend) a local edit and show it immediately.
    ///
    /// A later edit on the same record overwrites the patched values but
    /// keeps the original base version, so a conflict that raced the first
    /// edit cannot be masked.
    pub fn begin_edit(&self, id: RecordId, patch: RecordData) -> Result<EditTicket, CacheError> {
        if patch.is_empty() {
            return Err(CacheError::EmptyPatch);
        }
        let edit = self.next_edit.fetch_add(1, Ordering::Relaxed) + 1;
        self.mutate(|snapshot| {
            let entry = snapshot
                .records
                .get_mut(&id)
                .ok_or(CacheError::UnknownRecord(id))?;
            match &mut entry.pending {
                Some(pending) => pending.supersede(patch, edit),
                None => {
                    entry.pending = Some(PendingPatch::new(entry.confirmed.version, patch, edit));
                }
            }
            Ok(EditTicket { id, edit })
        })
    }

    /// Reconcile the server's response to the request that carried `ticket`.
    pub fn resolve_mutation_result(&self, ticket: EditTicket, authoritative: Record) -> MergeOutcome {
        self.mutate(|snapshot| {
            let Some(entry) = snapshot.records.get_mut(&ticket.id) else {
                snapshot.insert_front(authoritative);
                return MergeOutcome::Inserted;
            };

            let is_latest = entry
                .pending
                .as_ref()
                .is_some_and(|pending| pending.latest_edit == ticket.edit);
            if !is_latest {
                // Superseded or already resolved: plain version comparison.
                return entry.accept_if_current(authoritative);
            }

            let matches = entry
                .pending
                .as_ref()
                .is_some_and(|pending| authoritative.matches_patch(&pending.patch));
            if matches {
                entry.confirmed = authoritative;
                entry.pending = None;
                entry.conflict = None;
                MergeOutcome::Replaced
            } else {
                log::debug!(
                    "Mutation result for record {} diverges from the local edit",
                    ticket.id
                );
                entry.conflict = Some(ConflictMarker {
                    server: authoritative,
                });
                MergeOutcome::Conflicted
            }
        })
    }

    /// Undo the optimistic part of an edit whose request failed.
    ///
    /// Never creates a conflict marker. When no other edit is still in
    /// flight the entry returns to its last confirmed state, or to the
    /// newer server snapshot held by a conflict marker.
    pub fn fail_mutation(&self, ticket: EditTicket) -> MergeOutcome {
        self.mutate(|snapshot| {
            let Some(entry) = snapshot.records.get_mut(&ticket.id) else {
                return MergeOutcome::Ignored;
            };
            let Some(pending) = &mut entry.pending else {
                return MergeOutcome::Ignored;
            };
            if !pending.withdraw(ticket.edit) {
                return MergeOutcome::Ignored;
            }
            if pending.patch.is_empty() {
                entry.pending = None;
                if let Some(marker) = entry.conflict.take() {
                    if marker.server.version > entry.confirmed.version {
                        entry.confirmed = marker.server;
                    }
                }
            }
            MergeOutcome::RolledBack
        })
    }

    /// Reconcile a record arriving from the live feed.
    pub fn apply_incoming(&self, incoming: Record) -> MergeOutcome {
        self.mutate(|snapshot| match snapshot.records.get_mut(&incoming.id) {
            Some(entry) => entry.reconcile(incoming),
            None => {
                snapshot.insert_front(incoming);
                MergeOutcome::Inserted
            }
        })
    }

    /// Explicit user action: drop the local edit and adopt the server snapshot.
    pub fn resolve_conflict(&self, id: RecordId) -> Result<Record, CacheError> {
        self.mutate(|snapshot| {
            let entry = snapshot
                .records
                .get_mut(&id)
                .ok_or(CacheError::UnknownRecord(id))?;
            let marker = entry.conflict.take().ok_or(CacheError::NoConflict(id))?;
            entry.confirmed = marker.server;
            entry.pending = None;
            Ok(entry.confirmed.clone())
        })
    }

    /// Merge a fetched page. Known rows go through the reconciler so a
    /// refetch never clobbers pending edits; new rows are appended.
    pub fn merge_page(
        &self,
        rows: Vec<Record>,
        next_cursor: Option<RecordId>,
        total: u64,
    ) -> Vec<MergeOutcome> {
        self.mutate(|snapshot| {
            let outcomes = rows
                .into_iter()
                .map(|row| match snapshot.records.get_mut(&row.id) {
                    Some(entry) => entry.reconcile(row),
                    None => {
                        snapshot.insert_back(row);
                        MergeOutcome::Inserted
                    }
                })
                .collect();
            if next_cursor.is_some() {
                snapshot.next_cursor = next_cursor;
            }
            snapshot.exhausted = next_cursor.is_none();
            snapshot.total = total;
            outcomes
        })
    }
}
