//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use fieldsync_common::{Error, Result};

/// Configuration for sync cycles and retry accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed pushes after which an item is frozen.
    pub max_attempts: u32,
    /// Ascending base delays, indexed by attempt; the last entry repeats.
    pub retry_delays_ms: Vec<u64>,
    /// Upper bound of the random jitter, as a fraction of the base delay.
    pub jitter_ratio: f64,
    /// Deadline for a single push call.
    pub push_timeout_ms: u64,
    /// Deadline for a single pull call.
    pub pull_timeout_ms: u64,
    /// How long exhausted items are kept before cleanup removes them.
    pub cleanup_retention_secs: u64,
    /// Name of the single-flight cycle lock.
    pub lock_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delays_ms: vec![5_000, 15_000, 60_000, 300_000, 900_000],
            jitter_ratio: 0.3,
            push_timeout_ms: 30_000,
            pull_timeout_ms: 60_000,
            cleanup_retention_secs: 7 * 24 * 60 * 60,
            lock_name: "fieldsync-cycle".to_string(),
        }
    }
}

impl SyncConfig {
    /// Sets the retry ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the retry delay table.
    pub fn with_retry_delays(mut self, delays: &[Duration]) -> Self {
        self.retry_delays_ms = delays.iter().copied().map(millis).collect();
        self
    }

    /// Sets the jitter ratio.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Sets the push deadline.
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout_ms = millis(timeout);
        self
    }

    /// Sets the pull deadline.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout_ms = millis(timeout);
        self
    }

    /// Sets the cleanup retention, truncated to whole seconds.
    pub fn with_cleanup_retention(mut self, retention: Duration) -> Self {
        self.cleanup_retention_secs = retention.as_secs();
        self
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn cleanup_retention(&self) -> Duration {
        Duration::from_secs(self.cleanup_retention_secs)
    }

    /// Check the configuration for values the engine cannot work with.
    ///
    /// # Errors
    /// - `max_attempts` is zero
    /// - retry delays are empty or not ascending
    /// - jitter ratio outside `[0, 1)`
    /// - zero timeouts
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput("max_attempts must be at least 1".to_string()));
        }
        if self.retry_delays_ms.is_empty() {
            return Err(Error::InvalidInput("retry_delays_ms cannot be empty".to_string()));
        }
        if self.retry_delays_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::InvalidInput(
                "retry_delays_ms must be ascending".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(Error::InvalidInput(format!(
                "jitter_ratio {} must be within [0, 1)",
                self.jitter_ratio
            )));
        }
        if self.push_timeout_ms == 0 || self.pull_timeout_ms == 0 {
            return Err(Error::InvalidInput("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
