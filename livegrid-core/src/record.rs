//! Versioned records, change events and node identity.
//!
//! A [`Record`] is the unit of shared mutable state. Every successful
//! mutation produces exactly one [`ChangeEvent`], tagged with the
//! [`NodeIdentity`] of the process that committed it.
//!
//! Wire shape (JSON):
//! ```text
//! { "id": 7, "data": { "title": "A", ... },
//!   "createdAt": "...", "updatedAt": "...", "version": 3 }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Stable record identifier, assigned at creation and never reused.
pub type RecordId = u64;

/// Schema-free field map carried by a record.
pub type RecordData = Map<String, Value>;

/// A version-stamped row as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub data: RecordData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1, +1 on every successful mutation.
    pub version: u64,
}

impl Record {
    /// Create the first version of a record.
    pub fn new_created(id: RecordId, data: RecordData, now: DateTime<Utc>) -> Self {
        Self {
            id,
            data,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Read a single field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Apply a shallow, field-level merge and produce the next version.
    ///
    /// Fields in `patch` overwrite existing fields; fields not named in
    /// `patch` are left untouched.
    pub fn patched(&self, patch: &RecordData, now: DateTime<Utc>) -> Record {
        let mut next = self.overlaid(patch);
        next.updated_at = now;
        next.version = self.version + 1;
        next
    }

    /// Overlay `patch` on a copy without touching `version` or `updated_at`.
    pub fn overlaid(&self, patch: &RecordData) -> Record {
        let mut next = self.clone();
        for (field, value) in patch {
            next.data.insert(field.clone(), value.clone());
        }
        next
    }

    /// Whether every field named in `patch` holds exactly the patched value.
    ///
    /// A missing field compares equal to `null`.
    pub fn matches_patch(&self, patch: &RecordData) -> bool {
        patch
            .iter()
            .all(|(field, value)| self.data.get(field).unwrap_or(&Value::Null) == value)
    }
}

/// What kind of mutation produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
        }
    }
}

/// Opaque per-process token used to recognise self-originated events.
///
/// Created once at process start and stable until exit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Generate a fresh identity: `<pid>-<random suffix>`.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", std::process::id(), &suffix[..7]))
    }

    /// Use an externally supplied identity (e.g. a configured server id).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `event` was produced by this node.
    pub fn is_origin_of(&self, event: &ChangeEvent) -> bool {
        event.origin == *self
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable notification describing one successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: Record,
    pub origin: NodeIdentity,
}

impl ChangeEvent {
    pub fn created(record: Record, origin: NodeIdentity) -> Self {
        Self {
            kind: ChangeKind::Created,
            record,
            origin,
        }
    }

    pub fn updated(record: Record, origin: NodeIdentity) -> Self {
        Self {
            kind: ChangeKind::Updated,
            record,
            origin,
        }
    }
}
