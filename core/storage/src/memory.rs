//! In-memory local store for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::store::{LocalStore, WriteBatch, WriteOp};
use fieldsync_common::{EntityType, Error, MutationItem, Record, Result};

#[derive(Debug, Clone, Default)]
struct Tables {
    records: HashMap<EntityType, BTreeMap<String, Record>>,
    queue: BTreeMap<String, MutationItem>,
    meta: HashMap<String, String>,
}

impl Tables {
    fn apply_op(&mut self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::PutRecord {
                entity_type,
                id,
                record,
            } => {
                self.records.entry(entity_type).or_default().insert(id, record);
            }
            WriteOp::AddRecord {
                entity_type,
                id,
                record,
            } => {
                let table = self.records.entry(entity_type).or_default();
                if table.contains_key(&id) {
                    return Err(Error::AlreadyExists(format!("{}/{}", entity_type, id)));
                }
                table.insert(id, record);
            }
            WriteOp::UpdateRecord {
                entity_type,
                id,
                changes,
            } => {
                let existing = self
                    .records
                    .get_mut(&entity_type)
                    .and_then(|table| table.get_mut(&id))
                    .ok_or_else(|| Error::NotFound(format!("{}/{}", entity_type, id)))?;
                existing.extend(changes);
            }
            WriteOp::DeleteRecord { entity_type, id } => {
                if let Some(table) = self.records.get_mut(&entity_type) {
                    table.remove(&id);
                }
            }
            WriteOp::PutQueueItem(item) => {
                self.queue.insert(item.id.clone(), item);
            }
            WriteOp::DeleteQueueItem(id) => {
                self.queue.remove(&id);
            }
            WriteOp::SetMeta { key, value } => {
                self.meta.insert(key, value);
            }
        }
        Ok(())
    }
}

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Batches are applied to a scratch copy and swapped
/// in only when every write succeeded.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>> {
        let tables = self.read()?;
        Ok(tables
            .records
            .get(&entity_type)
            .and_then(|table| table.get(id))
            .cloned())
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Record>> {
        let tables = self.read()?;
        Ok(tables
            .records
            .get(&entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_items(&self) -> Result<Vec<MutationItem>> {
        let tables = self.read()?;
        let mut items: Vec<MutationItem> = tables.queue.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn queue_item(&self, id: &str) -> Result<Option<MutationItem>> {
        Ok(self.read()?.queue.get(id).cloned())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read()?.meta.get(key).cloned())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.write()?;
        let mut scratch = tables.clone();
        for op in batch.into_ops() {
            scratch.apply_op(op)?;
        }
        *tables = scratch;
        Ok(())
    }
}
