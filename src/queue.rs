//! Pending-operation queue - the ordered log of unconfirmed local mutations.
//!
//! The queue holds at most one operation per record id. Coalescing folds each
//! new mutation into the existing entry for its record, which both keeps
//! remote calls in per-record order and prevents duplicate calls for the same
//! logical change. Entries stay queued while in flight; only a confirmation
//! for the revision that was actually sent clears one.

use crate::backoff::BackoffPolicy;
use crate::record::merge_patch;
use crate::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// The kind of remote call a pending operation maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// A not-yet-confirmed local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    /// Record this operation targets.
    pub id: RecordId,
    /// Remote call to perform.
    pub kind: OpKind,
    /// Create payload or update patch; `None` for deletes.
    pub payload: Option<serde_json::Value>,
    /// Failed send attempts so far.
    pub attempts: u32,
    /// Earliest time the next attempt may run.
    pub next_retry_at: Timestamp,
    /// When the first mutation behind this entry was queued.
    pub queued_at: Timestamp,
    /// Bumped whenever coalescing rewrites this entry, so a confirmation for
    /// a stale in-flight send cannot clear newer local intent.
    pub revision: u64,
}

/// What [`PendingQueue::enqueue`] did with an incoming mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was appended.
    Queued,
    /// The mutation was folded into the existing entry for its record.
    Coalesced,
    /// A delete cancelled an unsent create; nothing remains queued and the
    /// server is never told about either.
    CreateCancelled,
}

/// Ordered queue of pending operations, at most one per record id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQueue {
    ops: Vec<PendingOp>,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Rebuild a queue from persisted entries.
    pub fn from_ops(ops: Vec<PendingOp>) -> Self {
        Self { ops }
    }

    /// Queue a mutation, coalescing with any existing entry for the id.
    pub fn enqueue(
        &mut self,
        kind: OpKind,
        id: &str,
        payload: Option<serde_json::Value>,
        now: Timestamp,
    ) -> EnqueueOutcome {
        let position = self.ops.iter().position(|op| op.id == id);

        let Some(index) = position else {
            self.ops.push(PendingOp {
                id: id.to_string(),
                kind,
                payload,
                attempts: 0,
                next_retry_at: now,
                queued_at: now,
                revision: 0,
            });
            return EnqueueOutcome::Queued;
        };

        let entry = &mut self.ops[index];
        match (entry.kind, kind) {
            // Re-create while a delete (or stale entry) is still unsent:
            // the entry becomes a fresh create with the new payload.
            (_, OpKind::Create) => {
                entry.kind = OpKind::Create;
                entry.payload = payload;
                entry.queued_at = now;
                entry.attempts = 0;
                entry.next_retry_at = now;
                entry.revision += 1;
                EnqueueOutcome::Coalesced
            }
            // An update folds into whatever is already queued for the id,
            // keeping the entry's kind and retry schedule.
            (OpKind::Create | OpKind::Update, OpKind::Update) => {
                match (&mut entry.payload, payload) {
                    (Some(existing), Some(patch)) => merge_patch(existing, &patch),
                    (slot, patch) => *slot = patch,
                }
                entry.revision += 1;
                EnqueueOutcome::Coalesced
            }
            // Editing a record whose delete is still queued resurrects the
            // entry as an update.
            (OpKind::Delete, OpKind::Update) => {
                entry.kind = OpKind::Update;
                entry.payload = payload;
                entry.revision += 1;
                EnqueueOutcome::Coalesced
            }
            // A delete cancels an unsent create outright.
            (OpKind::Create, OpKind::Delete) => {
                self.ops.remove(index);
                EnqueueOutcome::CreateCancelled
            }
            (OpKind::Update, OpKind::Delete) => {
                entry.kind = OpKind::Delete;
                entry.payload = None;
                entry.revision += 1;
                EnqueueOutcome::Coalesced
            }
            (OpKind::Delete, OpKind::Delete) => EnqueueOutcome::Coalesced,
        }
    }

    /// Clones of the operations whose retry time has arrived, in queue order.
    pub fn dequeue_ready(&self, now: Timestamp) -> Vec<PendingOp> {
        self.ops
            .iter()
            .filter(|op| op.next_retry_at <= now)
            .cloned()
            .collect()
    }

    /// Clones of every queued operation, in queue order.
    pub fn all(&self) -> Vec<PendingOp> {
        self.ops.clone()
    }

    /// The queued operation for a record, if any.
    pub fn get(&self, id: &str) -> Option<&PendingOp> {
        self.ops.iter().find(|op| op.id == id)
    }

    /// Whether a record has a queued operation.
    pub fn has(&self, id: &str) -> bool {
        self.ops.iter().any(|op| op.id == id)
    }

    /// Confirm a sent operation.
    ///
    /// Removes the entry and returns true only if its revision still matches
    /// the one that was sent. If the entry was coalesced while the send was
    /// in flight, the newer intent stays queued with its attempt counter
    /// reset (the link is clearly alive) and false is returned.
    pub fn mark_succeeded(&mut self, id: &str, revision: u64) -> bool {
        let Some(index) = self.ops.iter().position(|op| op.id == id) else {
            return false;
        };

        if self.ops[index].revision == revision {
            self.ops.remove(index);
            true
        } else {
            let entry = &mut self.ops[index];
            entry.attempts = 0;
            entry.next_retry_at = entry.queued_at;
            false
        }
    }

    /// Record a failed send: bump the attempt counter and push the next
    /// retry out per the backoff policy. Returns the new attempt count.
    pub fn mark_failed(&mut self, id: &str, now: Timestamp, policy: &BackoffPolicy) -> Option<u32> {
        let entry = self.ops.iter_mut().find(|op| op.id == id)?;
        entry.attempts += 1;
        entry.next_retry_at = now + policy.delay_for(entry.attempts).as_millis() as Timestamp;
        Some(entry.attempts)
    }

    /// Drop an entry unconditionally (server rejected it as unsatisfiable).
    pub fn remove(&mut self, id: &str) -> Option<PendingOp> {
        let index = self.ops.iter().position(|op| op.id == id)?;
        Some(self.ops.remove(index))
    }

    /// Earliest `next_retry_at` across queued operations.
    pub fn next_ready_at(&self) -> Option<Timestamp> {
        self.ops.iter().map(|op| op.next_retry_at).min()
    }

    /// View of the queued operations, in queue order.
    pub fn ops(&self) -> &[PendingOp] {
        &self.ops
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_appends() {
        let mut queue = PendingQueue::new();

        let outcome = queue.enqueue(OpKind::Create, "car-1", Some(json!({"year": 2020})), 100);
        assert_eq!(outcome, EnqueueOutcome::Queued);
        assert_eq!(queue.len(), 1);

        let op = queue.get("car-1").unwrap();
        assert_eq!(op.kind, OpKind::Create);
        assert_eq!(op.attempts, 0);
        assert_eq!(op.queued_at, 100);
        assert_eq!(op.next_retry_at, 100);
    }

    #[test]
    fn update_on_update_merges_payloads() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Update, "car-1", Some(json!({"a": 1})), 100);
        let outcome = queue.enqueue(OpKind::Update, "car-1", Some(json!({"b": 2})), 200);

        assert_eq!(outcome, EnqueueOutcome::Coalesced);
        assert_eq!(queue.len(), 1);

        let op = queue.get("car-1").unwrap();
        assert_eq!(op.payload, Some(json!({"a": 1, "b": 2})));
        assert_eq!(op.queued_at, 100, "earliest queued_at is kept");
        assert_eq!(op.revision, 1);
    }

    #[test]
    fn update_on_create_merges_into_create() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({"year": 2020})), 100);
        queue.enqueue(OpKind::Update, "car-1", Some(json!({"color": "red"})), 200);

        let op = queue.get("car-1").unwrap();
        assert_eq!(op.kind, OpKind::Create);
        assert_eq!(op.payload, Some(json!({"year": 2020, "color": "red"})));
    }

    #[test]
    fn delete_cancels_unsent_create() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({"year": 2020})), 100);
        let outcome = queue.enqueue(OpKind::Delete, "car-1", None, 200);

        assert_eq!(outcome, EnqueueOutcome::CreateCancelled);
        assert!(queue.is_empty());
    }

    #[test]
    fn delete_replaces_queued_update() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Update, "car-1", Some(json!({"a": 1})), 100);
        let outcome = queue.enqueue(OpKind::Delete, "car-1", None, 200);

        assert_eq!(outcome, EnqueueOutcome::Coalesced);
        let op = queue.get("car-1").unwrap();
        assert_eq!(op.kind, OpKind::Delete);
        assert_eq!(op.payload, None);
        assert_eq!(op.queued_at, 100);
    }

    #[test]
    fn recreate_over_queued_delete() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Delete, "car-1", None, 100);
        queue.enqueue(OpKind::Create, "car-1", Some(json!({"year": 2021})), 200);

        assert_eq!(queue.len(), 1);
        let op = queue.get("car-1").unwrap();
        assert_eq!(op.kind, OpKind::Create);
        assert_eq!(op.payload, Some(json!({"year": 2021})));
        assert_eq!(op.queued_at, 200);
    }

    #[test]
    fn dequeue_ready_filters_by_retry_time() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({})), 100);
        queue.enqueue(OpKind::Create, "car-2", Some(json!({})), 100);

        let policy = BackoffPolicy::new(
            std::time::Duration::from_millis(500),
            std::time::Duration::from_secs(30),
        )
        .with_jitter(false);
        queue.mark_failed("car-2", 100, &policy);

        let ready = queue.dequeue_ready(100);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "car-1");

        let ready = queue.dequeue_ready(600);
        assert_eq!(ready.len(), 2);
    }

    #[test]
    fn dequeue_ready_keeps_entries_queued() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({})), 100);

        let ready = queue.dequeue_ready(100);
        assert_eq!(ready.len(), 1);
        assert_eq!(queue.len(), 1, "in-flight ops stay queued until confirmed");
    }

    #[test]
    fn mark_succeeded_removes_matching_revision() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({})), 100);

        let sent = queue.dequeue_ready(100).remove(0);
        assert!(queue.mark_succeeded("car-1", sent.revision));
        assert!(queue.is_empty());
    }

    #[test]
    fn mark_succeeded_keeps_coalesced_entry() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({"a": 1})), 100);

        let sent = queue.dequeue_ready(100).remove(0);
        // A new edit lands while the create is in flight.
        queue.enqueue(OpKind::Update, "car-1", Some(json!({"b": 2})), 150);

        assert!(!queue.mark_succeeded("car-1", sent.revision));
        assert_eq!(queue.len(), 1);
        let op = queue.get("car-1").unwrap();
        assert_eq!(op.payload, Some(json!({"a": 1, "b": 2})));
        assert_eq!(op.attempts, 0);
    }

    #[test]
    fn mark_failed_backs_off() {
        let policy = BackoffPolicy::new(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_secs(30),
        )
        .with_jitter(false);

        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({})), 1000);

        assert_eq!(queue.mark_failed("car-1", 1000, &policy), Some(1));
        assert_eq!(queue.get("car-1").unwrap().next_retry_at, 1100);

        assert_eq!(queue.mark_failed("car-1", 1100, &policy), Some(2));
        assert_eq!(queue.get("car-1").unwrap().next_retry_at, 1300);

        assert_eq!(queue.mark_failed("car-1", 1300, &policy), Some(3));
        assert_eq!(queue.get("car-1").unwrap().next_retry_at, 1700);

        assert_eq!(queue.mark_failed("unknown", 1000, &policy), None);
    }

    #[test]
    fn failure_reuses_the_same_entry() {
        let policy = BackoffPolicy::default().with_jitter(false);
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({})), 100);

        queue.mark_failed("car-1", 100, &policy);
        queue.mark_failed("car-1", 200, &policy);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get("car-1").unwrap().attempts, 2);
        assert_eq!(queue.get("car-1").unwrap().queued_at, 100);
    }

    #[test]
    fn remove_drops_unconditionally() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Update, "car-1", Some(json!({})), 100);

        let dropped = queue.remove("car-1").unwrap();
        assert_eq!(dropped.kind, OpKind::Update);
        assert!(queue.is_empty());
        assert!(queue.remove("car-1").is_none());
    }

    #[test]
    fn next_ready_at_is_the_minimum() {
        let policy = BackoffPolicy::new(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(30),
        )
        .with_jitter(false);

        let mut queue = PendingQueue::new();
        assert_eq!(queue.next_ready_at(), None);

        queue.enqueue(OpKind::Create, "car-1", Some(json!({})), 100);
        queue.enqueue(OpKind::Create, "car-2", Some(json!({})), 200);
        queue.mark_failed("car-1", 1000, &policy);

        assert_eq!(queue.next_ready_at(), Some(200));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut queue = PendingQueue::new();
        queue.enqueue(OpKind::Create, "car-1", Some(json!({"year": 2020})), 100);
        queue.enqueue(OpKind::Delete, "car-2", None, 200);

        let encoded = serde_json::to_string(&queue).unwrap();
        assert!(encoded.contains("nextRetryAt"));

        let parsed: PendingQueue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(queue, parsed);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_kind() -> impl Strategy<Value = OpKind> {
            prop_oneof![
                Just(OpKind::Create),
                Just(OpKind::Update),
                Just(OpKind::Delete),
            ]
        }

        fn arb_id() -> impl Strategy<Value = String> {
            prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())]
        }

        proptest! {
            #[test]
            fn at_most_one_op_per_id(
                mutations in proptest::collection::vec((arb_id(), arb_kind()), 0..40),
            ) {
                let mut queue = PendingQueue::new();
                for (step, (id, kind)) in mutations.into_iter().enumerate() {
                    let payload = match kind {
                        OpKind::Delete => None,
                        _ => Some(serde_json::json!({ "step": step })),
                    };
                    queue.enqueue(kind, &id, payload, step as Timestamp);

                    let mut ids: Vec<_> = queue.ops().iter().map(|op| op.id.clone()).collect();
                    let total = ids.len();
                    ids.sort();
                    ids.dedup();
                    prop_assert_eq!(ids.len(), total);
                }
            }

            #[test]
            fn coalesced_updates_equal_patch_union(
                first in proptest::collection::btree_map("[a-d]", 0i64..100, 0..4),
                second in proptest::collection::btree_map("[a-d]", 0i64..100, 0..4),
            ) {
                let mut queue = PendingQueue::new();
                queue.enqueue(OpKind::Update, "car-1", Some(serde_json::json!(first)), 0);
                queue.enqueue(OpKind::Update, "car-1", Some(serde_json::json!(second)), 1);

                let mut expected = first.clone();
                expected.extend(second.clone());

                let op = queue.get("car-1").unwrap();
                prop_assert_eq!(op.payload.clone(), Some(serde_json::json!(expected)));
            }
        }
    }
}
