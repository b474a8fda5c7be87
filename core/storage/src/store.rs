//! Local store trait definition.

use async_trait::async_trait;

use fieldsync_common::{EntityType, MutationItem, Record, Result};

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace a record.
    PutRecord {
        entity_type: EntityType,
        id: String,
        record: Record,
    },
    /// Insert a record; fails with `AlreadyExists` if the id is taken.
    AddRecord {
        entity_type: EntityType,
        id: String,
        record: Record,
    },
    /// Merge fields into an existing record; fails with `NotFound` if missing.
    UpdateRecord {
        entity_type: EntityType,
        id: String,
        changes: Record,
    },
    /// Remove a record. Missing records are ignored.
    DeleteRecord { entity_type: EntityType, id: String },
    /// Insert or replace a queue row.
    PutQueueItem(MutationItem),
    /// Remove a queue row. Missing rows are ignored.
    DeleteQueueItem(String),
    /// Write a metadata slot.
    SetMeta { key: String, value: String },
}

/// An ordered group of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_record(mut self, entity_type: EntityType, id: impl Into<String>, record: Record) -> Self {
        self.ops.push(WriteOp::PutRecord {
            entity_type,
            id: id.into(),
            record,
        });
        self
    }

    pub fn add_record(mut self, entity_type: EntityType, id: impl Into<String>, record: Record) -> Self {
        self.ops.push(WriteOp::AddRecord {
            entity_type,
            id: id.into(),
            record,
        });
        self
    }

    pub fn update_record(
        mut self,
        entity_type: EntityType,
        id: impl Into<String>,
        changes: Record,
    ) -> Self {
        self.ops.push(WriteOp::UpdateRecord {
            entity_type,
            id: id.into(),
            changes,
        });
        self
    }

    pub fn delete_record(mut self, entity_type: EntityType, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::DeleteRecord {
            entity_type,
            id: id.into(),
        });
        self
    }

    pub fn put_queue_item(mut self, item: MutationItem) -> Self {
        self.ops.push(WriteOp::PutQueueItem(item));
        self
    }

    pub fn delete_queue_item(mut self, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::DeleteQueueItem(id.into()));
        self
    }

    pub fn set_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(WriteOp::SetMeta {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Append the writes of another batch.
    pub fn merge(mut self, other: WriteBatch) -> Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Device-local persistent store used by the sync engine.
///
/// Holds one table per [`EntityType`], the mutation queue and a metadata
/// key-value slot. Reads are independent; every write goes through
/// [`LocalStore::apply`], which must commit the whole batch or nothing.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Get a record by id.
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>>;

    /// List every record of an entity type.
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Record>>;

    /// All queue rows, oldest first.
    async fn queue_items(&self) -> Result<Vec<MutationItem>>;

    /// Get a queue row by its id.
    async fn queue_item(&self, id: &str) -> Result<Option<MutationItem>>;

    /// Read a metadata slot.
    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Apply a batch of writes atomically.
    ///
    /// # Postconditions
    /// - Either every write is durable or none is
    ///
    /// # Errors
    /// - `AlreadyExists` / `NotFound` from add and update writes
    /// - Backend storage failures
    async fn apply(&self, batch: WriteBatch) -> Result<()>;

    /// Insert or replace a record.
    async fn put(&self, entity_type: EntityType, id: &str, record: Record) -> Result<()> {
        self.apply(WriteBatch::new().put_record(entity_type, id, record))
            .await
    }

    /// Insert a new record.
    async fn add(&self, entity_type: EntityType, id: &str, record: Record) -> Result<()> {
        self.apply(WriteBatch::new().add_record(entity_type, id, record))
            .await
    }

    /// Merge fields into an existing record.
    async fn update(&self, entity_type: EntityType, id: &str, changes: Record) -> Result<()> {
        self.apply(WriteBatch::new().update_record(entity_type, id, changes))
            .await
    }

    /// Delete a record.
    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.apply(WriteBatch::new().delete_record(entity_type, id))
            .await
    }

    /// Write a metadata slot.
    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.apply(WriteBatch::new().set_meta(key, value)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder_keeps_order() {
        let batch = WriteBatch::new()
            .put_record(EntityType::Zona, "z1", Record::new())
            .delete_queue_item("q1")
            .set_meta("checkpoint", "2024-01-01T00:00:00Z");

        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops()[0], WriteOp::PutRecord { .. }));
        assert!(matches!(batch.ops()[1], WriteOp::DeleteQueueItem(_)));
        assert!(matches!(batch.ops()[2], WriteOp::SetMeta { .. }));
    }

    #[test]
    fn test_batch_merge() {
        let a = WriteBatch::new().delete_record(EntityType::Riego, "r1");
        let b = WriteBatch::new().delete_queue_item("q1");
        let merged = a.merge(b);
        assert_eq!(merged.len(), 2);
        assert!(!merged.is_empty());
    }
}
