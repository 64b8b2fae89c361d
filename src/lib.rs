//! # Tether
//!
//! An offline-first synchronization engine for local-first clients.
//!
//! Tether keeps an in-memory collection of records consistent with a remote
//! authoritative store under unreliable connectivity. Consumers read and
//! mutate the local collection synchronously and optimistically; the engine
//! reconciles local writes made while offline with the server's state when
//! connectivity returns, without losing updates, duplicating creates, or
//! resurrecting deletes.
//!
//! ## How it fits together
//!
//! - [`LocalStore`] is the record cache consumers read. Mutations apply to it
//!   immediately and fire subscribers synchronously.
//! - [`PendingQueue`] logs unconfirmed mutations, coalescing to at most one
//!   operation per record: successive updates merge, a delete cancels an
//!   unsent create outright.
//! - A background driver retries queued operations against the
//!   [`RemoteTransport`] with capped exponential backoff ([`BackoffPolicy`]),
//!   indefinitely.
//! - Reconciliation passes fetch a full [`RemoteTransport::list`] on first
//!   sync and [`RemoteTransport::changes_since`] a checkpoint afterwards,
//!   merging by last-write-wins timestamp while never overwriting a record
//!   with a queued local operation.
//! - Every committed change is persisted through the [`PersistenceAdapter`]
//!   as a single [`EngineSnapshot`], loaded once at startup.
//!
//! ## Quick start
//!
//! ```rust
//! use tether::{EngineConfig, MemoryAdapter, MockTransport, SyncEngine};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = SyncEngine::new(
//!     EngineConfig::new(),
//!     MockTransport::new(),
//!     MemoryAdapter::new(),
//! );
//!
//! // Mutations are optimistic and synchronous.
//! engine.mutate("car-1", Some(json!({"make": "Saab", "year": 2003})));
//! assert_eq!(engine.get_all().len(), 1);
//!
//! // Push the queue and reconcile with the remote store.
//! let outcome = engine.flush_now().await.unwrap();
//! assert_eq!(outcome.pushed, 1);
//! assert!(engine.get_by_id("car-1").unwrap().is_confirmed());
//! # }
//! ```
//!
//! ## Error handling
//!
//! Consumer-facing calls never surface transport or persistence failures:
//! [`SyncEngine::mutate`] always succeeds locally. Failures are reported
//! through the event sink ([`SyncEngine::set_event_sink`]) and `tracing`;
//! only a server-side rejection ([`SyncEvent::OpRejected`]) warrants showing
//! the user anything, since local intent provably cannot be satisfied.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod persist;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod transport;

// Re-export main types at crate root
pub use backoff::BackoffPolicy;
pub use config::EngineConfig;
pub use engine::{EventSink, FlushOutcome, SyncEngine, SyncEvent, SyncStats};
pub use error::{Error, Result};
pub use persist::{MemoryAdapter, PersistenceAdapter};
pub use queue::{EnqueueOutcome, OpKind, PendingOp, PendingQueue};
pub use reconcile::{merge_remote_changes, MergeSummary, SyncPhase};
pub use record::Record;
pub use snapshot::{EngineSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use store::{ListenerRegistry, LocalStore, StoreEvent, SubscriptionId};
pub use transport::{MockTransport, RemoteChange, RemoteTransport};

/// Type aliases for clarity
pub type RecordId = String;
pub type Timestamp = u64;
