//! Remote transport boundary.
//!
//! The transport is the engine's window onto the authoritative remote store.
//! Implementations wrap whatever RPC stack the application uses; the engine
//! only assumes the five-call contract below. [`MockTransport`] provides an
//! in-memory authoritative server with scriptable failures for tests.

use crate::error::{Error, Result};
use crate::{Record, RecordId, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// One entry in a `changes_since` delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RemoteChange {
    /// A record created or updated since the cursor.
    Upsert {
        /// Canonical record with server-assigned timestamps.
        record: Record,
    },
    /// A record deleted since the cursor.
    Delete {
        /// The deleted record's id.
        id: RecordId,
        /// When the server performed the deletion.
        deleted_at: Timestamp,
    },
}

/// RPC contract against the remote authoritative collection.
///
/// `create` must tolerate duplicate calls for the same client-chosen id
/// (a retried request whose first attempt actually succeeded) by returning
/// the canonical record rather than failing.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Full collection fetch.
    async fn list(&self) -> Result<Vec<Record>>;

    /// Delta fetch: changes strictly after the cursor. Empty when up to date.
    async fn changes_since(&self, cursor: Timestamp) -> Result<Vec<RemoteChange>>;

    /// Create a record; returns the canonical version with server timestamps.
    async fn create(&self, record: &Record) -> Result<Record>;

    /// Apply a partial update; returns the canonical version.
    async fn update(&self, id: &str, patch: &serde_json::Value) -> Result<Record>;

    /// Delete a record; returns the deleted id.
    async fn delete(&self, id: &str) -> Result<RecordId>;
}

#[async_trait]
impl<T: RemoteTransport + ?Sized> RemoteTransport for std::sync::Arc<T> {
    async fn list(&self) -> Result<Vec<Record>> {
        (**self).list().await
    }

    async fn changes_since(&self, cursor: Timestamp) -> Result<Vec<RemoteChange>> {
        (**self).changes_since(cursor).await
    }

    async fn create(&self, record: &Record) -> Result<Record> {
        (**self).create(record).await
    }

    async fn update(&self, id: &str, patch: &serde_json::Value) -> Result<Record> {
        (**self).update(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<RecordId> {
        (**self).delete(id).await
    }
}

#[derive(Debug, Default)]
struct ServerState {
    records: BTreeMap<RecordId, Record>,
    tombstones: BTreeMap<RecordId, Timestamp>,
}

/// An in-memory authoritative server for tests.
///
/// Behaves like a well-behaved remote: assigns monotonic timestamps, keeps
/// tombstones for deletions, and treats a replayed `create` for an existing
/// id as success. Failures are scripted with [`MockTransport::set_offline`]
/// and [`MockTransport::fail_requests`].
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<ServerState>,
    clock: AtomicU64,
    offline: AtomicBool,
    fail_requests: AtomicU32,
    create_calls: AtomicU32,
    update_calls: AtomicU32,
    delete_calls: AtomicU32,
    list_calls: AtomicU32,
    changes_calls: AtomicU32,
}

impl MockTransport {
    /// Create an empty mock server. Timestamps start at 1000.
    pub fn new() -> Self {
        let transport = Self::default();
        transport.clock.store(1000, Ordering::SeqCst);
        transport
    }

    /// Take the server offline: every call fails with a retryable error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a retryable transport error.
    pub fn fail_requests(&self, n: u32) {
        self.fail_requests.store(n, Ordering::SeqCst);
    }

    /// Insert a record directly into the server, bypassing the transport.
    /// The server clock is advanced past the record's `updated_at`.
    pub fn seed_record(&self, record: Record) {
        if let Some(updated_at) = record.updated_at {
            self.clock.fetch_max(updated_at, Ordering::SeqCst);
        }
        self.state.lock().records.insert(record.id.clone(), record);
    }

    /// Record a server-side deletion directly, bypassing the transport.
    pub fn seed_tombstone(&self, id: impl Into<RecordId>, deleted_at: Timestamp) {
        self.clock.fetch_max(deleted_at, Ordering::SeqCst);
        let mut state = self.state.lock();
        let id = id.into();
        state.records.remove(&id);
        state.tombstones.insert(id, deleted_at);
    }

    /// Current server-side copy of a record.
    pub fn record(&self, id: &str) -> Option<Record> {
        self.state.lock().records.get(id).cloned()
    }

    /// Number of live records on the server.
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Number of `create` calls that reached the server.
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `update` calls that reached the server.
    pub fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls that reached the server.
    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Number of `list` calls that reached the server.
    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of `changes_since` calls that reached the server.
    pub fn changes_calls(&self) -> u32 {
        self.changes_calls.load(Ordering::SeqCst)
    }

    fn tick(&self) -> Timestamp {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transport_retryable("server unreachable"));
        }
        if self.fail_requests.load(Ordering::SeqCst) > 0 {
            self.fail_requests.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::transport_retryable("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn list(&self) -> Result<Vec<Record>> {
        self.check_available()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().records.values().cloned().collect())
    }

    async fn changes_since(&self, cursor: Timestamp) -> Result<Vec<RemoteChange>> {
        self.check_available()?;
        self.changes_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock();
        let mut changes: Vec<RemoteChange> = state
            .records
            .values()
            .filter(|r| r.updated_at.is_some_and(|t| t > cursor))
            .map(|r| RemoteChange::Upsert { record: r.clone() })
            .collect();
        changes.extend(
            state
                .tombstones
                .iter()
                .filter(|(_, &deleted_at)| deleted_at > cursor)
                .map(|(id, &deleted_at)| RemoteChange::Delete {
                    id: id.clone(),
                    deleted_at,
                }),
        );
        Ok(changes)
    }

    async fn create(&self, record: &Record) -> Result<Record> {
        self.check_available()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(existing) = state.records.get(&record.id) {
            // Replay of a create whose earlier attempt already landed.
            return Ok(existing.clone());
        }

        state.tombstones.remove(&record.id);
        let now = self.tick();
        let canonical = Record::confirmed(record.id.clone(), record.fields.clone(), now, now);
        state.records.insert(canonical.id.clone(), canonical.clone());
        Ok(canonical)
    }

    async fn update(&self, id: &str, patch: &serde_json::Value) -> Result<Record> {
        self.check_available()?;
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if state.tombstones.contains_key(id) {
            return Err(Error::conflict(id, "record deleted"));
        }
        let Some(record) = state.records.get_mut(id) else {
            return Err(Error::conflict(id, "unknown record"));
        };

        record.apply_patch(patch);
        record.updated_at = Some(self.tick());
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> Result<RecordId> {
        self.check_available()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if state.records.remove(id).is_some() {
            let now = self.tick();
            state.tombstones.insert(id.to_string(), now);
        }
        // Deleting an already-deleted or unknown record is a no-op success.
        Ok(id.to_string())
    }
}
