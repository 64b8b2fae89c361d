//! The synchronization engine - consumer surface and background driver.
//!
//! [`SyncEngine`] owns the local store, the pending-operation queue, and the
//! sync checkpoint. Consumers read and mutate synchronously; a background
//! driver task debounces snapshot saves, dispatches queued operations with
//! backoff, and runs reconciliation passes against the remote transport.
//!
//! Mutations never surface transport or persistence errors: `mutate` always
//! succeeds locally and returns immediately. Failures are reported
//! asynchronously through the event sink and `tracing`.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::persist::PersistenceAdapter;
use crate::queue::{OpKind, PendingQueue};
use crate::reconcile::{merge_remote_changes, MergeSummary, SyncPhase};
use crate::record::Record;
use crate::snapshot::EngineSnapshot;
use crate::store::{ListenerRegistry, LocalStore, StoreEvent, SubscriptionId};
use crate::transport::{RemoteChange, RemoteTransport};
use crate::{RecordId, Timestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex as AsyncMutex, Notify};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// Asynchronous observability notification from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A queued operation was confirmed by the server.
    OpSynced {
        /// The confirmed record's id.
        id: RecordId,
    },
    /// A queued operation failed and will be retried.
    OpFailed {
        /// The record whose operation failed.
        id: RecordId,
        /// Failed attempts so far.
        attempts: u32,
        /// Transport failure description.
        message: String,
    },
    /// The server rejected an operation as unsatisfiable; it was dropped.
    /// This is the one signal worth surfacing to the user, since local
    /// intent provably cannot be fulfilled.
    OpRejected {
        /// The record whose operation was rejected.
        id: RecordId,
        /// Server rejection reason.
        message: String,
    },
    /// A reconciliation pass committed.
    PassCompleted {
        /// What the pass merged.
        summary: MergeSummary,
    },
    /// A reconciliation pass aborted; the checkpoint is unchanged.
    PassFailed {
        /// Fetch failure description.
        message: String,
    },
    /// A snapshot save failed; in-memory state remains authoritative.
    PersistenceFailed {
        /// Save failure description.
        message: String,
    },
}

/// Callback receiving [`SyncEvent`]s.
pub type EventSink = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Counters describing the engine's sync activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Operations confirmed by the server.
    pub ops_pushed: u64,
    /// Failed send attempts (each will be retried).
    pub ops_failed: u64,
    /// Operations dropped after a server rejection.
    pub conflicts_dropped: u64,
    /// Reconciliation passes committed.
    pub passes_completed: u64,
    /// Reconciliation passes aborted.
    pub passes_failed: u64,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
}

/// Result of a forced [`SyncEngine::flush_now`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Operations confirmed during the flush.
    pub pushed: usize,
    /// Operations that failed and stay queued.
    pub failed: usize,
    /// Operations dropped after server rejection.
    pub dropped: usize,
    /// Merge summary of the reconciliation pass, if it ran to commit.
    pub merge: Option<MergeSummary>,
}

#[derive(Debug, Default)]
struct DispatchTotals {
    pushed: usize,
    failed: usize,
    dropped: usize,
}

/// State owned by the engine, guarded by a single mutex that is never held
/// across an await point.
struct Shared {
    store: LocalStore,
    queue: PendingQueue,
    checkpoint: Option<Timestamp>,
    phase: SyncPhase,
    dirty: bool,
    last_mutation: Option<Instant>,
    online: bool,
    started: bool,
}

struct Inner<T, P> {
    config: EngineConfig,
    transport: T,
    persistence: P,
    shared: Mutex<Shared>,
    listeners: Mutex<ListenerRegistry>,
    events: Mutex<Option<EventSink>>,
    save_guard: AsyncMutex<()>,
    pass_guard: AsyncMutex<()>,
    wake: Notify,
    shutdown: AtomicBool,
    pass_requested: AtomicBool,
    stats: Mutex<SyncStats>,
}

/// The offline-first synchronization engine.
///
/// Cheap to clone; all clones share the same state.
pub struct SyncEngine<T, P> {
    inner: Arc<Inner<T, P>>,
}

impl<T, P> Clone for SyncEngine<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, P> SyncEngine<T, P>
where
    T: RemoteTransport + 'static,
    P: PersistenceAdapter + 'static,
{
    /// Create an engine over a transport and a persistence adapter.
    ///
    /// The engine is inert until [`SyncEngine::start`] spawns the background
    /// driver; local reads and mutations work either way.
    pub fn new(config: EngineConfig, transport: T, persistence: P) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                persistence,
                shared: Mutex::new(Shared {
                    store: LocalStore::new(),
                    queue: PendingQueue::new(),
                    checkpoint: None,
                    phase: SyncPhase::Idle,
                    dirty: false,
                    last_mutation: None,
                    online: true,
                    started: false,
                }),
                listeners: Mutex::new(ListenerRegistry::new()),
                events: Mutex::new(None),
                save_guard: AsyncMutex::new(()),
                pass_guard: AsyncMutex::new(()),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
                pass_requested: AtomicBool::new(false),
                stats: Mutex::new(SyncStats::default()),
            }),
        }
    }

    /// Install the observability callback.
    pub fn set_event_sink(&self, sink: impl Fn(&SyncEvent) + Send + Sync + 'static) {
        *self.inner.events.lock() = Some(Box::new(sink));
    }

    /// Load the persisted snapshot, rehydrate state, and spawn the driver.
    ///
    /// Must complete before consumers interact with the engine; calling it
    /// again is a no-op.
    pub async fn start(&self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.started {
                return Ok(());
            }
            shared.started = true;
        }

        let loaded = match self.inner.persistence.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.inner.shared.lock().started = false;
                return Err(e);
            }
        };

        if let Some(snapshot) = loaded {
            if let Err(e) = snapshot.check_format() {
                self.inner.shared.lock().started = false;
                return Err(e);
            }

            let mut shared = self.inner.shared.lock();
            let mut store = LocalStore::new();
            for (_, record) in snapshot.records {
                store.insert(record);
            }
            shared.store = store;
            shared.queue = PendingQueue::from_ops(snapshot.pending_ops);
            shared.checkpoint = snapshot.checkpoint;
            tracing::info!(
                records = shared.store.len(),
                pending = shared.queue.len(),
                checkpoint = ?shared.checkpoint,
                "rehydrated from snapshot"
            );
        }

        self.inner.pass_requested.store(true, Ordering::SeqCst);
        let engine = self.clone();
        tokio::spawn(async move { engine.drive().await });
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Cloned snapshot of every record.
    pub fn get_all(&self) -> Vec<Record> {
        self.inner.shared.lock().store.list()
    }

    /// Cloned snapshot of one record.
    pub fn get_by_id(&self, id: &str) -> Option<Record> {
        self.inner.shared.lock().store.get(id).cloned()
    }

    /// Apply a local mutation optimistically.
    ///
    /// `Some(patch)` creates the record or merges the patch into it; `None`
    /// deletes it. The store is updated and listeners fire before this call
    /// returns; the remote send and snapshot save happen in the background.
    pub fn mutate(&self, id: &str, patch: Option<serde_json::Value>) {
        let now = now_ms();

        let event = {
            let mut shared = self.inner.shared.lock();
            let event = match patch {
                Some(patch) => {
                    let (record, kind) = match shared.store.get(id) {
                        Some(existing) => {
                            let mut updated = existing.clone();
                            updated.apply_patch(&patch);
                            (updated, OpKind::Update)
                        }
                        None => (Record::new(id, patch.clone()), OpKind::Create),
                    };
                    shared.store.insert(record.clone());
                    shared.queue.enqueue(kind, id, Some(patch), now);
                    Some(StoreEvent::Upserted { record })
                }
                None => {
                    if !shared.store.contains(id) && !shared.queue.has(id) {
                        None
                    } else {
                        shared.queue.enqueue(OpKind::Delete, id, None, now);
                        shared
                            .store
                            .remove(id)
                            .map(|_| StoreEvent::Removed { id: id.to_string() })
                    }
                }
            };
            shared.dirty = true;
            shared.last_mutation = Some(Instant::now());
            event
        };

        if let Some(event) = &event {
            self.notify_listeners(std::slice::from_ref(event));
        }
        self.inner.wake.notify_one();
    }

    /// Register a change listener. Listeners run synchronously on the
    /// mutating call; they may read from the engine but must not mutate it.
    pub fn subscribe(
        &self,
        listener: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.listeners.lock().subscribe(listener)
    }

    /// Remove a change listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.lock().unsubscribe(id)
    }

    /// Signal that connectivity returned: dispatch and reconcile promptly.
    pub fn notify_online(&self) {
        self.inner.shared.lock().online = true;
        self.inner.pass_requested.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        tracing::debug!("connectivity reported online");
    }

    /// Signal that connectivity was lost: stop dispatching until it returns.
    pub fn notify_offline(&self) {
        self.inner.shared.lock().online = false;
        tracing::debug!("connectivity reported offline");
    }

    /// Force an immediate retry of every queued operation (regardless of
    /// backoff deadlines) followed by a reconciliation pass.
    pub async fn flush_now(&self) -> Result<FlushOutcome> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        self.save_if_dirty().await;
        let totals = self.dispatch(true).await;
        let merge = self.run_pass().await.ok();

        Ok(FlushOutcome {
            pushed: totals.pushed,
            failed: totals.failed,
            dropped: totals.dropped,
            merge,
        })
    }

    /// Stop the driver after a final snapshot save. Queued operations
    /// persist and resume on the next startup.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        self.save_if_dirty().await;
        tracing::info!("engine shut down");
    }

    /// Current reconciliation phase.
    pub fn phase(&self) -> SyncPhase {
        self.inner.shared.lock().phase
    }

    /// Current sync checkpoint.
    pub fn checkpoint(&self) -> Option<Timestamp> {
        self.inner.shared.lock().checkpoint
    }

    /// Number of unconfirmed queued operations.
    pub fn pending_count(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Cloned snapshot of the unconfirmed queued operations, in queue order.
    pub fn pending_ops(&self) -> Vec<crate::queue::PendingOp> {
        self.inner.shared.lock().queue.all()
    }

    /// Snapshot of the engine's activity counters.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.lock().clone()
    }

    fn notify_listeners(&self, events: &[StoreEvent]) {
        let listeners = self.inner.listeners.lock();
        for event in events {
            listeners.notify(event);
        }
    }

    fn emit(&self, event: SyncEvent) {
        let sink = self.inner.events.lock();
        if let Some(sink) = sink.as_ref() {
            sink(&event);
        }
    }

    /// Background driver: debounced saves, backoff dispatch, and passes.
    async fn drive(self) {
        let mut last_pass = Instant::now();

        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let wait = self.next_wait(last_pass);
            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let (settled, online) = {
                let shared = self.inner.shared.lock();
                let settled = shared
                    .last_mutation
                    .map_or(true, |t| t.elapsed() >= self.inner.config.debounce);
                (settled, shared.online)
            };

            if settled {
                let had_mutations = {
                    let mut shared = self.inner.shared.lock();
                    shared.last_mutation.take().is_some()
                };
                self.save_if_dirty().await;
                if online {
                    self.dispatch(false).await;
                }
                if had_mutations {
                    // Mutations settled: pull remote changes as well.
                    self.inner.pass_requested.store(true, Ordering::SeqCst);
                }
            }

            if online {
                if let Some(interval) = self.inner.config.sync_interval {
                    if last_pass.elapsed() >= interval {
                        self.inner.pass_requested.store(true, Ordering::SeqCst);
                    }
                }
                if self.inner.pass_requested.load(Ordering::SeqCst) {
                    let _ = self.run_pass().await;
                    last_pass = Instant::now();
                }
            }
        }

        self.save_if_dirty().await;
    }

    /// How long the driver may sleep before something needs attention.
    fn next_wait(&self, last_pass: Instant) -> Duration {
        // Idle heartbeat; also paces retries of a failed initial pass.
        let mut wait = Duration::from_secs(60);
        let now = now_ms();

        {
            let shared = self.inner.shared.lock();
            // Nothing runs before mutations settle, so every deadline is
            // floored by the remaining debounce window.
            let settle = shared
                .last_mutation
                .map_or(Duration::ZERO, |t| self.inner.config.debounce.saturating_sub(t.elapsed()));
            if shared.dirty {
                wait = wait.min(settle);
            }
            if shared.online {
                if let Some(next) = shared.queue.next_ready_at() {
                    let until = Duration::from_millis(next.saturating_sub(now));
                    wait = wait.min(until.max(settle));
                }
            }
        }

        if let Some(interval) = self.inner.config.sync_interval {
            wait = wait.min(interval.saturating_sub(last_pass.elapsed()));
        }

        wait
    }

    /// Send ready operations to the transport. `force` ignores both the
    /// offline flag and backoff deadlines (explicit flush).
    async fn dispatch(&self, force: bool) -> DispatchTotals {
        let now = now_ms();
        let ready = {
            let shared = self.inner.shared.lock();
            if !shared.online && !force {
                Vec::new()
            } else if force {
                shared.queue.all()
            } else {
                shared.queue.dequeue_ready(now)
            }
        };

        let mut totals = DispatchTotals::default();
        for op in ready {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let result = match op.kind {
                OpKind::Create => {
                    let payload = op
                        .payload
                        .clone()
                        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
                    let record = Record::new(op.id.clone(), payload);
                    self.inner.transport.create(&record).await.map(Some)
                }
                OpKind::Update => {
                    let patch = op
                        .payload
                        .clone()
                        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
                    self.inner.transport.update(&op.id, &patch).await.map(Some)
                }
                OpKind::Delete => self.inner.transport.delete(&op.id).await.map(|_| None),
            };

            match result {
                Ok(canonical) => {
                    let event = {
                        let mut shared = self.inner.shared.lock();
                        let cleared = shared.queue.mark_succeeded(&op.id, op.revision);
                        shared.dirty = true;
                        match (cleared, canonical) {
                            (true, Some(record)) => {
                                shared.store.insert(record.clone());
                                Some(StoreEvent::Upserted { record })
                            }
                            // Either a delete (nothing to merge) or newer
                            // local intent was coalesced in while the send
                            // was in flight; that intent stays authoritative.
                            _ => None,
                        }
                    };
                    if let Some(event) = &event {
                        self.notify_listeners(std::slice::from_ref(event));
                    }
                    self.inner.stats.lock().ops_pushed += 1;
                    tracing::debug!(id = %op.id, kind = ?op.kind, "operation confirmed");
                    self.emit(SyncEvent::OpSynced { id: op.id.clone() });
                    totals.pushed += 1;
                }
                Err(e) if e.is_retryable() => {
                    let attempts = {
                        let mut shared = self.inner.shared.lock();
                        shared.dirty = true;
                        shared
                            .queue
                            .mark_failed(&op.id, now_ms(), &self.inner.config.backoff)
                            .unwrap_or(0)
                    };
                    {
                        let mut stats = self.inner.stats.lock();
                        stats.ops_failed += 1;
                        stats.last_error = Some(e.to_string());
                    }
                    tracing::warn!(id = %op.id, attempts, error = %e, "operation failed, queued for retry");
                    self.emit(SyncEvent::OpFailed {
                        id: op.id.clone(),
                        attempts,
                        message: e.to_string(),
                    });
                    totals.failed += 1;
                }
                Err(e) => {
                    {
                        let mut shared = self.inner.shared.lock();
                        shared.queue.remove(&op.id);
                        shared.dirty = true;
                    }
                    {
                        let mut stats = self.inner.stats.lock();
                        stats.conflicts_dropped += 1;
                        stats.last_error = Some(e.to_string());
                    }
                    tracing::warn!(id = %op.id, error = %e, "operation rejected, dropped from queue");
                    self.emit(SyncEvent::OpRejected {
                        id: op.id.clone(),
                        message: e.to_string(),
                    });
                    // The next pass re-establishes truth for this record.
                    self.inner.pass_requested.store(true, Ordering::SeqCst);
                    totals.dropped += 1;
                }
            }
        }

        if totals.pushed + totals.failed + totals.dropped > 0 {
            self.save_if_dirty().await;
        }
        totals
    }

    /// One reconciliation pass: fetch, merge, commit. Never runs
    /// concurrently with itself.
    async fn run_pass(&self) -> Result<MergeSummary> {
        let _guard = self.inner.pass_guard.lock().await;
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.inner.pass_requested.store(false, Ordering::SeqCst);

        let checkpoint = {
            let mut shared = self.inner.shared.lock();
            shared.phase = SyncPhase::Fetching;
            shared.checkpoint
        };

        let fetched = match checkpoint {
            None => self.inner.transport.list().await.map(|records| {
                records
                    .into_iter()
                    .map(|record| RemoteChange::Upsert { record })
                    .collect::<Vec<_>>()
            }),
            Some(cursor) => self.inner.transport.changes_since(cursor).await,
        };

        let changes = match fetched {
            Ok(changes) => changes,
            Err(e) => {
                self.inner.shared.lock().phase = SyncPhase::Failed;
                {
                    let mut stats = self.inner.stats.lock();
                    stats.passes_failed += 1;
                    stats.last_error = Some(e.to_string());
                }
                tracing::warn!(error = %e, "reconciliation fetch failed");
                self.emit(SyncEvent::PassFailed {
                    message: e.to_string(),
                });
                self.inner.pass_requested.store(true, Ordering::SeqCst);
                self.inner.shared.lock().phase = SyncPhase::Idle;
                return Err(e);
            }
        };

        if self.inner.shutdown.load(Ordering::SeqCst) {
            // Shutdown arrived mid-fetch: discard the partial results.
            self.inner.shared.lock().phase = SyncPhase::Idle;
            return Err(Error::Closed);
        }

        let (summary, events) = {
            let mut shared = self.inner.shared.lock();
            shared.phase = SyncPhase::Merging;
            let Shared { store, queue, .. } = &mut *shared;
            let (summary, events) = merge_remote_changes(store, queue, changes);
            if let Some(max) = summary.max_updated_at {
                shared.checkpoint = Some(shared.checkpoint.map_or(max, |c| c.max(max)));
            }
            shared.phase = SyncPhase::Committed;
            shared.dirty = true;
            (summary, events)
        };

        self.notify_listeners(&events);
        self.inner.stats.lock().passes_completed += 1;
        tracing::debug!(
            applied = summary.applied,
            removed = summary.removed,
            skipped = summary.skipped_pending,
            checkpoint = ?self.checkpoint(),
            "reconciliation pass committed"
        );
        self.emit(SyncEvent::PassCompleted {
            summary: summary.clone(),
        });

        self.save_if_dirty().await;
        self.inner.shared.lock().phase = SyncPhase::Idle;
        Ok(summary)
    }

    /// Persist the current state if anything changed since the last save.
    /// The async guard keeps `save` calls from ever overlapping.
    async fn save_if_dirty(&self) {
        let _guard = self.inner.save_guard.lock().await;

        let snapshot = {
            let mut shared = self.inner.shared.lock();
            if !shared.dirty {
                return;
            }
            shared.dirty = false;
            let mut snapshot = EngineSnapshot::new();
            for record in shared.store.iter() {
                snapshot.add_record(record.clone());
            }
            snapshot.pending_ops = shared.queue.all();
            snapshot.checkpoint = shared.checkpoint;
            snapshot
        };

        if let Err(e) = self.inner.persistence.save(&snapshot).await {
            self.inner.shared.lock().dirty = true;
            self.inner.stats.lock().last_error = Some(e.to_string());
            tracing::warn!(error = %e, "snapshot save failed; in-memory state stays authoritative");
            self.emit(SyncEvent::PersistenceFailed {
                message: e.to_string(),
            });
        }
    }
}
