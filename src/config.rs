//! Configuration for the sync engine.

use crate::backoff::BackoffPolicy;
use std::time::Duration;

/// Configuration passed to the engine's constructor.
///
/// The transport and persistence adapter are constructor arguments rather
/// than configuration fields; everything here is a plain scalar policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Backoff policy for retrying failed remote operations.
    pub backoff: BackoffPolicy,
    /// How long local mutations may settle before the snapshot is saved and
    /// queued operations are dispatched. Coalesces bursts of edits into one
    /// persistence write.
    pub debounce: Duration,
    /// Optional cadence for periodic reconciliation passes.
    pub sync_interval: Option<Duration>,
}

impl EngineConfig {
    /// Create a configuration with default policies.
    pub fn new() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            debounce: Duration::from_millis(500),
            sync_interval: None,
        }
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the mutation-settle debounce.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Enable periodic reconciliation passes.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.sync_interval, None);
        assert_eq!(config.backoff, BackoffPolicy::default());
    }

    #[test]
    fn builder_chain() {
        let config = EngineConfig::new()
            .with_backoff(
                BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(5))
                    .with_jitter(false),
            )
            .with_debounce(Duration::from_millis(10))
            .with_sync_interval(Duration::from_secs(30));

        assert_eq!(config.backoff.base, Duration::from_millis(50));
        assert_eq!(config.debounce, Duration::from_millis(10));
        assert_eq!(config.sync_interval, Some(Duration::from_secs(30)));
    }
}
