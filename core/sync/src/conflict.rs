//! Conflict listing and resolution.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use fieldsync_common::{
    Action, EntityType, Error, MutationItem, Record, Resolution, Result, ID_FIELD,
    LOCAL_MODIFIED_FIELD,
};
use fieldsync_storage::WriteBatch;

use crate::clock::Clock;
use crate::queue::MutationQueue;

/// Result of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionResult {
    /// Local data kept; the item is pending again.
    Requeued(MutationItem),
    /// Remote data adopted and the local edit dropped.
    AdoptedServer {
        entity_type: EntityType,
        entity_id: String,
        record: Record,
    },
}

/// View over queue items in `conflict` state.
///
/// Conflicts are never settled automatically; they wait here for a decision.
#[derive(Clone)]
pub struct ConflictStore {
    queue: Arc<MutationQueue>,
    clock: Arc<dyn Clock>,
}

impl ConflictStore {
    pub fn new(queue: Arc<MutationQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock }
    }

    /// Unresolved conflicts, oldest first.
    pub async fn list(&self) -> Result<Vec<MutationItem>> {
        self.queue.conflicts().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationItem>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|item| item.id == id))
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    /// Settle a conflict.
    ///
    /// With `Server`, the remote record is written to the local table in the
    /// same batch that removes the queue item. A local write made after the
    /// conflict was raised is laid over it and stays queued; if that write
    /// was a delete, the remote record is not restored.
    ///
    /// # Errors
    /// - `NotFound` if no item has this id
    /// - `InvalidState` if the item is not in conflict
    pub async fn resolve(&self, id: &str, decision: Resolution) -> Result<ResolutionResult> {
        match decision {
            Resolution::Local => {
                let item = self
                    .queue
                    .resolve_conflict(id, Resolution::Local)
                    .await?
                    .ok_or_else(|| Error::InvalidState(format!("queue item {} vanished", id)))?;
                Ok(ResolutionResult::Requeued(item))
            }
            Resolution::Server => {
                let now = self.clock.now();
                let mut adopted = None;
                self.queue
                    .resolve_conflict_with(id, Resolution::Server, |item, follow_up| {
                        let mut record = item.server_payload.clone().ok_or_else(|| {
                            Error::InvalidState(format!(
                                "queue item {} has no server data",
                                item.id
                            ))
                        })?;

                        let deleted = follow_up.is_some_and(|f| f.action == Action::Delete);
                        if let Some(follow_up) = follow_up.filter(|_| !deleted) {
                            debug!(
                                "Keeping newer local edit {} over server data for {}/{}",
                                follow_up.id, item.entity_type, item.entity_id
                            );
                            record.extend(follow_up.payload.clone());
                        }
                        record
                            .entry(ID_FIELD)
                            .or_insert_with(|| Value::String(item.entity_id.clone()));
                        record.insert(
                            LOCAL_MODIFIED_FIELD.to_string(),
                            Value::String(now.to_rfc3339()),
                        );

                        let batch = if deleted {
                            WriteBatch::new()
                        } else {
                            WriteBatch::new().put_record(
                                item.entity_type,
                                item.entity_id.clone(),
                                record.clone(),
                            )
                        };
                        adopted = Some((item.entity_type, item.entity_id.clone(), record));
                        Ok(batch)
                    })
                    .await?;

                let (entity_type, entity_id, record) = adopted
                    .ok_or_else(|| Error::InvalidState(format!("queue item {} vanished", id)))?;
                Ok(ResolutionResult::AdoptedServer {
                    entity_type,
                    entity_id,
                    record,
                })
            }
        }
    }
}
