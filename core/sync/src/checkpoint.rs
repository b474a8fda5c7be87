//! Pull progress high-watermark.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use fieldsync_common::Result;
use fieldsync_storage::LocalStore;

/// Metadata slot holding the checkpoint.
pub const CHECKPOINT_KEY: &str = "last_sync_at";

/// Global watermark of the last cycle in which every pull succeeded.
///
/// Only moves forward.
#[derive(Clone)]
pub struct Checkpoint {
    store: Arc<dyn LocalStore>,
}

impl Checkpoint {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Current watermark, `None` before the first complete pull.
    ///
    /// An unreadable stored value is treated as absent, which means a full pull.
    pub async fn load(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get_meta(CHECKPOINT_KEY).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                warn!("Ignoring unreadable checkpoint '{}': {}", raw, e);
                Ok(None)
            }
        }
    }

    /// Move the watermark to `candidate` if it is later than the current one.
    ///
    /// Returns whether the stored value changed.
    pub async fn advance(&self, candidate: DateTime<Utc>) -> Result<bool> {
        let current = self.load().await?;
        if current.is_some_and(|current| candidate <= current) {
            debug!("Checkpoint stays at {:?}", current);
            return Ok(false);
        }
        self.store
            .set_meta(CHECKPOINT_KEY, &candidate.to_rfc3339())
            .await?;
        debug!("Checkpoint advanced to {}", candidate);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fieldsync_storage::MemoryStore;

    #[tokio::test]
    async fn test_checkpoint_never_moves_back() {
        let checkpoint = Checkpoint::new(Arc::new(MemoryStore::new()));
        assert!(checkpoint.load().await.unwrap().is_none());

        let t1 = Utc::now();
        assert!(checkpoint.advance(t1).await.unwrap());
        assert!(!checkpoint.advance(t1 - Duration::hours(1)).await.unwrap());
        assert!(!checkpoint.advance(t1).await.unwrap());
        assert_eq!(checkpoint.load().await.unwrap(), Some(t1));

        let t2 = t1 + Duration::minutes(5);
        assert!(checkpoint.advance(t2).await.unwrap());
        assert_eq!(checkpoint.load().await.unwrap(), Some(t2));
    }

    #[tokio::test]
    async fn test_corrupt_value_reads_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store.set_meta(CHECKPOINT_KEY, "not a date").await.unwrap();
        let checkpoint = Checkpoint::new(store);
        assert!(checkpoint.load().await.unwrap().is_none());
    }
}
