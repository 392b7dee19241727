//! # Repository Traits
//!
//! Snapshot records and the repository interface every backend implements.
//! Bodies are opaque JSON; the repository never looks inside them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

// =============================================================================
// RECORDS
// =============================================================================

/// What a listing shows about a stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: Uuid,
    /// Run name; `latest` and `list` filter on it
    pub name: String,
    pub saved_at: DateTime<Utc>,
    /// Simulation tick the snapshot was taken at
    pub tick: u64,
}

/// Metadata plus the serialized simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub meta: SnapshotMeta,
    pub body: serde_json::Value,
}

impl SnapshotRecord {
    /// Wrap `body` with a fresh id and the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, tick: u64, body: serde_json::Value) -> Self {
        Self {
            meta: SnapshotMeta {
                snapshot_id: Uuid::new_v4(),
                name: name.into(),
                saved_at: Utc::now(),
                tick,
            },
            body,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.meta.snapshot_id
    }
}

/// Oldest first, by `saved_at` and then tick.
pub(crate) fn sort_oldest_first(metas: &mut [SnapshotMeta]) {
    metas.sort_by(|a, b| a.saved_at.cmp(&b.saved_at).then(a.tick.cmp(&b.tick)));
}

// =============================================================================
// SNAPSHOT REPOSITORY
// =============================================================================

/// Storage for simulation snapshots
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Store a record, replacing one with the same id
    async fn save(&self, record: &SnapshotRecord) -> Result<()>;

    /// Get a record by id
    async fn load(&self, snapshot_id: Uuid) -> Result<Option<SnapshotRecord>>;

    /// Most recent record of a run
    async fn latest(&self, name: &str) -> Result<Option<SnapshotRecord>>;

    /// Metadata of every record of a run, oldest first
    async fn list(&self, name: &str) -> Result<Vec<SnapshotMeta>>;

    /// Remove a record; removing a missing id is not an error
    async fn delete(&self, snapshot_id: Uuid) -> Result<()>;
}
