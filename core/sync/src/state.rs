//! Sync cycle state and reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the sync cycle currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// No cycle in progress.
    #[default]
    Idle,
    RecoveringOrphans,
    Pushing,
    Pulling,
    Cleanup,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::RecoveringOrphans => "recovering orphans",
            CyclePhase::Pushing => "pushing",
            CyclePhase::Pulling => "pulling",
            CyclePhase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Counters reported by one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Pushes the remote accepted. Includes items re-queued because they
    /// changed in flight and items removed from the queue mid-push.
    pub pushed: usize,
    /// Remote records written locally.
    pub pulled: usize,
    /// Items that became conflicts.
    pub conflicts: usize,
    /// Failed pushes, failed entity pulls and local storage failures.
    pub errors: usize,
}

impl CycleSummary {
    /// Whether the cycle did nothing at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {}, pulled {}, conflicts {}, errors {}",
            self.pushed, self.pulled, self.conflicts, self.errors
        )
    }
}

/// Point-in-time overview of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Open queue items (includes conflicts, excludes exhausted ones).
    pub pending: usize,
    pub conflicts: usize,
    /// Items that ran out of retries.
    pub failed: usize,
    /// Last complete pull.
    pub checkpoint: Option<DateTime<Utc>>,
    pub phase: CyclePhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_empty() {
        assert!(CycleSummary::default().is_empty());
        let summary = CycleSummary {
            errors: 1,
            ..Default::default()
        };
        assert!(!summary.is_empty());
        assert_eq!(summary.to_string(), "pushed 0, pulled 0, conflicts 0, errors 1");
    }
}
