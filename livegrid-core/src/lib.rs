//! # livegrid-core: shared record model and client-side reconciliation
//!
//! ## Modules
//!
//! - [`record`]: Versioned records, change events, node identity
//! - [`reconcile`]: Optimistic merge reconciler over an immutable cache snapshot
//! - [`debounce`]: Debounced commit scheduling for cell edits
//!
//! Nothing in this crate performs I/O; the transport lives in `livegrid-sync`.

pub mod record;
pub mod reconcile;
pub mod debounce;

pub use record::{ChangeEvent, ChangeKind, NodeIdentity, Record, RecordData, RecordId};
pub use reconcile::{
    CacheError, CacheSnapshot, CachedRecord, ConflictMarker, EditTicket, MergeOutcome,
    PendingPatch, RecordCache,
};
pub use debounce::{CommitSink, DraftEditor, DraftError, EditorKind, DEFAULT_DEBOUNCE};
