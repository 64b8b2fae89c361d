//! Persistence adapter boundary.
//!
//! The engine treats durable storage as a scoped acquisition: `load` is
//! called once at startup, `save` on every committed change, and the engine
//! guarantees no two `save` calls overlap. Implementations must write
//! atomically (write-then-rename or equivalent) so concurrent readers never
//! observe a torn snapshot.

use crate::error::{Error, Result};
use crate::snapshot::EngineSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Durable snapshot storage consumed by the engine.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Load the most recent snapshot, or `None` on first run.
    async fn load(&self) -> Result<Option<EngineSnapshot>>;

    /// Durably store a snapshot, all-or-nothing.
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

#[async_trait]
impl<P: PersistenceAdapter + ?Sized> PersistenceAdapter for std::sync::Arc<P> {
    async fn load(&self) -> Result<Option<EngineSnapshot>> {
        (**self).load().await
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        (**self).save(snapshot).await
    }
}

/// In-memory persistence adapter for tests.
///
/// Stores the latest snapshot in a slot and can inject save failures to
/// exercise the engine's degraded mode.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    slot: Mutex<Option<EngineSnapshot>>,
    fail_saves: AtomicU32,
    save_count: AtomicU32,
}

impl MemoryAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter pre-loaded with a snapshot.
    pub fn with_snapshot(snapshot: EngineSnapshot) -> Self {
        Self {
            slot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Fail the next `n` saves with a persistence error.
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    /// The most recently saved snapshot.
    pub fn saved(&self) -> Option<EngineSnapshot> {
        self.slot.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u32 {
        self.save_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn load(&self) -> Result<Option<EngineSnapshot>> {
        Ok(self.slot.lock().clone())
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) > 0 {
            self.fail_saves.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Persistence("injected save failure".into()));
        }
        *self.slot.lock() = Some(snapshot.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
