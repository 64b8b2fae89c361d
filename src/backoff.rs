//! Exponential backoff policy for retrying failed remote operations.

use std::time::Duration;

/// Exponential backoff with a cap and optional jitter.
///
/// The delay for the n-th failed attempt is `min(max, base * 2^(n-1))`,
/// plus up to 25% jitter when enabled. Attempt 0 has no delay. There is no
/// attempt limit; callers needing bounded retry wrap the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,
    /// Upper bound on any computed delay.
    pub max: Duration,
    /// Whether to spread retries with jitter.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Create a policy with jitter enabled.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt, given the number of failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let exponent = attempts.saturating_sub(1).min(31) as i32;
        let raw = self.base.as_secs_f64() * 2f64.powi(exponent);
        let capped = raw.min(self.max.as_secs_f64());

        if self.jitter {
            // Up to 25% on top, still bounded below by the capped delay.
            Duration::from_secs_f64(capped + capped * 0.25 * time_jitter())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Cheap jitter source derived from the system clock's sub-second noise.
fn time_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
