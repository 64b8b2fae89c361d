//! Snapshot types for persisting and restoring engine state.
//!
//! Snapshots are the bridge between the in-memory engine and the persistence
//! adapter. They are designed for deterministic serialization so repeated
//! exports of the same state produce identical bytes.

use crate::error::{Error, Result};
use crate::queue::PendingOp;
use crate::{Record, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the engine state.
///
/// Holds everything needed to rehydrate after a restart: the record cache,
/// the pending-operation queue, and the sync checkpoint. Uses `BTreeMap`
/// for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    /// Snapshot format version.
    pub format_version: u32,
    /// All records by id.
    pub records: BTreeMap<RecordId, Record>,
    /// Operations not yet confirmed by the server.
    pub pending_ops: Vec<PendingOp>,
    /// Max server `updated_at` observed across committed passes.
    pub checkpoint: Option<Timestamp>,
}

impl EngineSnapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            records: BTreeMap::new(),
            pending_ops: Vec::new(),
            checkpoint: None,
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    /// Number of records in the snapshot.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Reject snapshots written by a newer engine.
    pub fn check_format(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON, rejecting future format versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.check_format()?;
        Ok(snapshot)
    }
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Snapshot format version.
    pub format_version: u32,
    /// Total record count.
    pub record_count: usize,
    /// Pending operation count.
    pub pending_count: usize,
    /// Sync checkpoint.
    pub checkpoint: Option<Timestamp>,
}

impl From<&EngineSnapshot> for SnapshotMetadata {
    fn from(snapshot: &EngineSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            record_count: snapshot.records.len(),
            pending_count: snapshot.pending_ops.len(),
            checkpoint: snapshot.checkpoint,
        }
    }
}
