//! Reconciliation - merging remote state into the local store.
//!
//! A pass fetches remote changes (full list or delta) and folds them into
//! the local store without clobbering unconfirmed local writes. The merge
//! itself is pure: it takes the fetched changes and the current queue and
//! produces store mutations plus a summary, leaving all I/O to the engine.
//!
//! # Merge rules, per fetched record
//!
//! 1. A record with a queued pending operation is skipped - local intent
//!    takes precedence over a possibly-stale remote read.
//! 2. Tombstones remove the local record.
//! 3. Unknown records are inserted.
//! 4. Otherwise last-write-wins by timestamp: remote replaces local iff
//!    `remote.updated_at >= local.updated_at`. Ties favor remote since it
//!    is authoritative; a never-confirmed local record counts as older than
//!    any remote version.

use crate::queue::PendingQueue;
use crate::store::{LocalStore, StoreEvent};
use crate::transport::RemoteChange;
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// No pass in progress.
    #[default]
    Idle,
    /// Fetching remote records.
    Fetching,
    /// Folding fetched records into the local store.
    Merging,
    /// Pass finished; checkpoint advanced and snapshot persisted.
    Committed,
    /// Pass aborted; checkpoint unchanged.
    Failed,
}

impl SyncPhase {
    /// Whether a pass is currently running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncPhase::Fetching | SyncPhase::Merging)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::Merging => write!(f, "merging"),
            SyncPhase::Committed => write!(f, "committed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of merging one batch of remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    /// Records inserted or replaced from remote.
    pub applied: usize,
    /// Records removed by remote tombstones.
    pub removed: usize,
    /// Changes skipped because local intent is still queued.
    pub skipped_pending: usize,
    /// Changes ignored because the local copy is newer.
    pub ignored_stale: usize,
    /// Max server timestamp observed in the batch, for the checkpoint.
    pub max_updated_at: Option<Timestamp>,
}

impl MergeSummary {
    fn observe(&mut self, timestamp: Option<Timestamp>) {
        if let Some(t) = timestamp {
            self.max_updated_at = Some(self.max_updated_at.map_or(t, |m| m.max(t)));
        }
    }
}

/// Fold a batch of remote changes into the local store.
///
/// Returns the summary and the store events to deliver to subscribers.
pub fn merge_remote_changes(
    store: &mut LocalStore,
    queue: &PendingQueue,
    changes: Vec<RemoteChange>,
) -> (MergeSummary, Vec<StoreEvent>) {
    let mut summary = MergeSummary::default();
    let mut events = Vec::new();

    for change in changes {
        match change {
            RemoteChange::Upsert { record } => {
                summary.observe(record.updated_at);

                if queue.has(&record.id) {
                    summary.skipped_pending += 1;
                    continue;
                }

                match store.get(&record.id) {
                    None => {
                        events.push(StoreEvent::Upserted {
                            record: record.clone(),
                        });
                        store.insert(record);
                        summary.applied += 1;
                    }
                    Some(local) => {
                        let local_ts = local.updated_at.unwrap_or(0);
                        let remote_ts = record.updated_at.unwrap_or(0);
                        if remote_ts >= local_ts {
                            events.push(StoreEvent::Upserted {
                                record: record.clone(),
                            });
                            store.insert(record);
                            summary.applied += 1;
                        } else {
                            summary.ignored_stale += 1;
                        }
                    }
                }
            }
            RemoteChange::Delete { id, deleted_at } => {
                summary.observe(Some(deleted_at));

                if queue.has(&id) {
                    summary.skipped_pending += 1;
                    continue;
                }

                if store.remove(&id).is_some() {
                    events.push(StoreEvent::Removed { id });
                    summary.removed += 1;
                }
            }
        }
    }

    (summary, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OpKind;
    use crate::Record;
    use serde_json::json;

    fn upsert(id: &str, fields: serde_json::Value, ts: Timestamp) -> RemoteChange {
        RemoteChange::Upsert {
            record: Record::confirmed(id, fields, ts, ts),
        }
    }

    #[test]
    fn phase_activity() {
        assert!(SyncPhase::Fetching.is_active());
        assert!(SyncPhase::Merging.is_active());
        assert!(!SyncPhase::Idle.is_active());
        assert!(!SyncPhase::Committed.is_active());
        assert!(!SyncPhase::Failed.is_active());
        assert_eq!(SyncPhase::default(), SyncPhase::Idle);
    }

    #[test]
    fn inserts_unknown_records() {
        let mut store = LocalStore::new();
        let queue = PendingQueue::new();

        let (summary, events) = merge_remote_changes(
            &mut store,
            &queue,
            vec![upsert("car-1", json!({"make": "Saab"}), 1000)],
        );

        assert_eq!(summary.applied, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(store.get("car-1").unwrap().fields, json!({"make": "Saab"}));
    }

    #[test]
    fn newer_remote_replaces_local() {
        let mut store = LocalStore::new();
        store.insert(Record::confirmed("car-1", json!({"year": 2020}), 500, 1000));
        let queue = PendingQueue::new();

        let (summary, _) = merge_remote_changes(
            &mut store,
            &queue,
            vec![upsert("car-1", json!({"year": 2021}), 2000)],
        );

        assert_eq!(summary.applied, 1);
        assert_eq!(store.get("car-1").unwrap().fields, json!({"year": 2021}));
    }

    #[test]
    fn stale_remote_is_ignored() {
        let mut store = LocalStore::new();
        store.insert(Record::confirmed("car-1", json!({"year": 2021}), 500, 2000));
        let queue = PendingQueue::new();

        let (summary, events) = merge_remote_changes(
            &mut store,
            &queue,
            vec![upsert("car-1", json!({"year": 2020}), 1000)],
        );

        assert_eq!(summary.ignored_stale, 1);
        assert_eq!(summary.applied, 0);
        assert!(events.is_empty());
        assert_eq!(store.get("car-1").unwrap().fields, json!({"year": 2021}));
    }

    #[test]
    fn timestamp_tie_favors_remote() {
        let mut store = LocalStore::new();
        store.insert(Record::confirmed("car-1", json!({"src": "local"}), 500, 1000));
        let queue = PendingQueue::new();

        let (summary, _) = merge_remote_changes(
            &mut store,
            &queue,
            vec![upsert("car-1", json!({"src": "remote"}), 1000)],
        );

        assert_eq!(summary.applied, 1);
        assert_eq!(store.get("car-1").unwrap().fields, json!({"src": "remote"}));
    }

    #[test]
    fn unconfirmed_local_loses_to_remote() {
        let mut store = LocalStore::new();
        store.insert(Record::new("car-1", json!({"src": "local"})));
        let queue = PendingQueue::new();

        let (summary, _) = merge_remote_changes(
            &mut store,
            &queue,
            vec![upsert("car-1", json!({"src": "remote"}), 1000)],
        );

        assert_eq!(summary.applied, 1);
        assert_eq!(store.get("car-1").unwrap().fields, json!({"src": "remote"}));
    }

    #[test]
    fn pending_operation_blocks_merge() {
        let mut store = LocalStore::new();
        store.insert(Record::confirmed("car-1", json!({"year": 2020}), 500, 1000));

        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Update, "car-1", Some(json!({"year": 2022})), 1500);

        // Remote is newer by timestamp, but local intent is still queued.
        let (summary, events) = merge_remote_changes(
            &mut store,
            &queue,
            vec![upsert("car-1", json!({"year": 2021}), 9999)],
        );

        assert_eq!(summary.skipped_pending, 1);
        assert!(events.is_empty());
        assert_eq!(store.get("car-1").unwrap().fields, json!({"year": 2020}));
        // The skipped change still counts toward the checkpoint.
        assert_eq!(summary.max_updated_at, Some(9999));
    }

    #[test]
    fn tombstone_removes_local_record() {
        let mut store = LocalStore::new();
        store.insert(Record::confirmed("car-1", json!({}), 500, 1000));
        let queue = PendingQueue::new();

        let (summary, events) = merge_remote_changes(
            &mut store,
            &queue,
            vec![RemoteChange::Delete {
                id: "car-1".into(),
                deleted_at: 2000,
            }],
        );

        assert_eq!(summary.removed, 1);
        assert_eq!(events, vec![StoreEvent::Removed { id: "car-1".into() }]);
        assert!(!store.contains("car-1"));
        assert_eq!(summary.max_updated_at, Some(2000));
    }

    #[test]
    fn tombstone_skips_pending_record() {
        let mut store = LocalStore::new();
        store.insert(Record::confirmed("car-1", json!({}), 500, 1000));

        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Update, "car-1", Some(json!({"year": 2021})), 1500);

        let (summary, _) = merge_remote_changes(
            &mut store,
            &queue,
            vec![RemoteChange::Delete {
                id: "car-1".into(),
                deleted_at: 2000,
            }],
        );

        assert_eq!(summary.skipped_pending, 1);
        assert!(store.contains("car-1"));
    }

    #[test]
    fn tombstone_for_unknown_record_is_a_noop() {
        let mut store = LocalStore::new();
        let queue = PendingQueue::new();

        let (summary, events) = merge_remote_changes(
            &mut store,
            &queue,
            vec![RemoteChange::Delete {
                id: "ghost".into(),
                deleted_at: 2000,
            }],
        );

        assert_eq!(summary.removed, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn max_updated_at_spans_the_batch() {
        let mut store = LocalStore::new();
        let queue = PendingQueue::new();

        let (summary, _) = merge_remote_changes(
            &mut store,
            &queue,
            vec![
                upsert("car-1", json!({}), 3000),
                upsert("car-2", json!({}), 1000),
                RemoteChange::Delete {
                    id: "car-3".into(),
                    deleted_at: 2500,
                },
            ],
        );

        assert_eq!(summary.max_updated_at, Some(3000));
    }

    #[test]
    fn empty_batch_observes_nothing() {
        let mut store = LocalStore::new();
        let queue = PendingQueue::new();

        let (summary, events) = merge_remote_changes(&mut store, &queue, vec![]);
        assert_eq!(summary, MergeSummary::default());
        assert!(events.is_empty());
        assert_eq!(summary.max_updated_at, None);
    }
}
