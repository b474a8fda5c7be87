//! Retry scheduling with a stepped backoff table and jitter.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use crate::config::SyncConfig;

/// Backoff policy for failed pushes.
///
/// Pure: it only computes when an item may be retried, the queue applies it.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    /// Ascending base delays, indexed by attempt.
    delays: Vec<Duration>,
    /// Attempts after which an item is frozen.
    max_attempts: u32,
    /// Jitter upper bound as a fraction of the base delay.
    jitter_ratio: f64,
}

impl RetryScheduler {
    /// Create a scheduler with the default 30% jitter.
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            delays,
            max_attempts,
            jitter_ratio: 0.3,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.retry_delays(), config.max_attempts).with_jitter_ratio(config.jitter_ratio)
    }

    /// Set the jitter ratio. Zero disables jitter.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay after the `attempt`-th failure (1-based), clamped to the table.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1) as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(index).copied().unwrap_or_default()
    }

    /// Base delay plus uniform jitter in `[0, ratio × base)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let jitter = base.as_secs_f64() * self.jitter_ratio * rand::random::<f64>();
        base + Duration::from_secs_f64(jitter)
    }

    /// Whether an item with this many failures is frozen.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// When an item that has now failed `attempts` times may run again.
    ///
    /// Returns `None` once the retry ceiling is reached.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_exhausted(attempts) {
            debug!("Retry ceiling of {} reached", self.max_attempts);
            return None;
        }
        let delay = self.delay_for_attempt(attempts);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
