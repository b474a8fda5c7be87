//! Persistent, coalescing queue of pending local writes.
//!
//! Every read-modify-write of a queue row happens under one async mutex, so
//! concurrent UI enqueues and the engine's own transitions never interleave
//! on the same item within a process.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fieldsync_common::{
    parse_timestamp, Action, EntityType, Error, ItemState, MutationItem, Record, Resolution,
    Result, LOCAL_MODIFIED_FIELD, SERVER_TIMESTAMP_FIELD,
};
use fieldsync_storage::{LocalStore, WriteBatch};

use crate::clock::Clock;
use crate::retry::RetryScheduler;

/// What happened to an item whose push succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The item was removed (and canonical data applied, if any).
    Removed,
    /// A newer local write was folded in while the push was in flight;
    /// the item went back to `pending` instead.
    Requeued,
    /// The item no longer existed.
    Missing,
}

/// Outcome of merging one pulled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMerge {
    Inserted,
    Overwritten,
    /// An unsettled local write exists for the entity.
    KeptLocal,
    /// The local copy is at least as new.
    Stale,
}

impl RemoteMerge {
    /// Whether the local table changed.
    pub fn wrote(self) -> bool {
        matches!(self, RemoteMerge::Inserted | RemoteMerge::Overwritten)
    }
}

/// Queue of local mutations awaiting delivery.
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    retry: RetryScheduler,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn LocalStore>, retry: RetryScheduler, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            retry,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts()
    }

    /// Queue a local write, folding it into any open item for the same entity.
    ///
    /// Items in `conflict` are never merged into; a write arriving while one
    /// exists becomes a separate item that waits behind the conflict.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: Action,
        payload: Record,
    ) -> Result<MutationItem> {
        self.enqueue_with(entity_type, entity_id, action, payload, WriteBatch::new())
            .await
    }

    /// Like [`enqueue`](Self::enqueue), committing `extra` writes in the same batch.
    pub async fn enqueue_with(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: Action,
        payload: Record,
        extra: WriteBatch,
    ) -> Result<MutationItem> {
        if entity_id.is_empty() {
            return Err(Error::InvalidInput("entity id cannot be empty".to_string()));
        }

        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();

        let existing = self
            .store
            .queue_items()
            .await?
            .into_iter()
            .find(|item| item.targets(entity_type, entity_id) && item.state != ItemState::Conflict);

        let item = match existing {
            Some(mut item) => {
                item.coalesce(action, payload, now);
                if item.is_exhausted(self.max_attempts()) {
                    item.reset_pending(now);
                    info!(
                        "New write revived exhausted queue item {} ({}/{})",
                        item.id, entity_type, entity_id
                    );
                }
                debug!(
                    "Coalesced {} into queue item {} ({}/{}, now {})",
                    action, item.id, entity_type, entity_id, item.action
                );
                item
            }
            None => {
                let item = MutationItem::new(entity_type, entity_id, action, payload, now);
                debug!("Queued {} for {}/{} as {}", action, entity_type, entity_id, item.id);
                item
            }
        };

        self.store
            .apply(WriteBatch::new().put_queue_item(item.clone()).merge(extra))
            .await?;
        Ok(item)
    }

    /// Every queue row, oldest first.
    pub async fn items(&self) -> Result<Vec<MutationItem>> {
        self.store.queue_items().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationItem>> {
        self.store.queue_item(id).await
    }

    /// Items to push now: `pending`, or `error` with retries left whose
    /// retry time has come. Items waiting behind a conflict on the same
    /// entity are held back.
    pub async fn due_for_sync(&self) -> Result<Vec<MutationItem>> {
        let now = self.clock.now();
        let max_attempts = self.max_attempts();
        let items = self.store.queue_items().await?;

        let blocked: HashSet<(EntityType, String)> = items
            .iter()
            .filter(|item| item.state == ItemState::Conflict)
            .map(|item| (item.entity_type, item.entity_id.clone()))
            .collect();

        Ok(items
            .into_iter()
            .filter(|item| item.is_due(now, max_attempts))
            .filter(|item| !blocked.contains(&(item.entity_type, item.entity_id.clone())))
            .collect())
    }

    /// Claim an item for a push attempt.
    pub async fn mark_syncing(&self, id: &str) -> Result<MutationItem> {
        let now = self.clock.now();
        self.update_item(id, |item| {
            if item.state == ItemState::Conflict {
                return Err(Error::InvalidState(format!(
                    "queue item {} is in conflict",
                    item.id
                )));
            }
            item.mark_syncing(now);
            Ok(())
        })
        .await
    }

    /// Remove an item after a successful push.
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store
            .apply(WriteBatch::new().delete_queue_item(id))
            .await
    }

    /// Settle a successful push of `pushed_revision`.
    ///
    /// Removes the item and writes `canonical` into its entity table in one
    /// batch. If the item was revised while the push was in flight, it is
    /// re-queued and `canonical` is not applied over the newer local edit.
    pub async fn complete_push(
        &self,
        id: &str,
        pushed_revision: u64,
        canonical: Option<Record>,
    ) -> Result<Completion> {
        let _guard = self.write_lock.lock().await;
        let Some(mut item) = self.store.queue_item(id).await? else {
            return Ok(Completion::Missing);
        };

        if item.revision != pushed_revision {
            item.reset_pending(self.clock.now());
            debug!(
                "Queue item {} changed during push (revision {} -> {}), re-queued",
                id, pushed_revision, item.revision
            );
            self.store
                .apply(WriteBatch::new().put_queue_item(item))
                .await?;
            return Ok(Completion::Requeued);
        }

        let mut batch = WriteBatch::new();
        if let Some(record) = canonical {
            batch = batch.put_record(item.entity_type, item.entity_id.clone(), record);
        }
        self.store.apply(batch.delete_queue_item(id)).await?;
        Ok(Completion::Removed)
    }

    /// Record a failed push and schedule the next attempt.
    ///
    /// Once the retry ceiling is reached the item is frozen without a retry time.
    pub async fn mark_error(&self, id: &str, message: &str) -> Result<MutationItem> {
        let now = self.clock.now();
        let item = self
            .update_item(id, |item| {
                let next = self.retry.next_retry_at(item.attempts + 1, now);
                item.mark_error(message, next, now);
                Ok(())
            })
            .await?;

        match item.next_retry_at {
            Some(at) => debug!(
                "Queue item {} failed (attempt {}), retry at {}: {}",
                item.id, item.attempts, at, message
            ),
            None => warn!(
                "Queue item {} gave up after {} attempts: {}",
                item.id, item.attempts, message
            ),
        }
        Ok(item)
    }

    /// Freeze an item in favor of the remote's data until someone resolves it.
    pub async fn mark_conflict(&self, id: &str, server_payload: Record) -> Result<MutationItem> {
        let now = self.clock.now();
        let item = self
            .update_item(id, |item| {
                item.mark_conflict(server_payload, now);
                Ok(())
            })
            .await?;
        info!(
            "Conflict on {}/{} (queue item {})",
            item.entity_type, item.entity_id, item.id
        );
        Ok(item)
    }

    /// Resolve a conflicted item.
    ///
    /// `Local` puts the item back to `pending` with a fresh retry budget;
    /// `Server` removes it. Returns the surviving item, if any.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        decision: Resolution,
    ) -> Result<Option<MutationItem>> {
        self.resolve_conflict_with(id, decision, |_, _| Ok(WriteBatch::new()))
            .await
    }

    /// Resolve a conflict, committing the writes produced by `extra` atomically
    /// with the queue change.
    ///
    /// `extra` receives the conflicted item and the follow-up item queued
    /// behind it, if one exists. With `Local`, the follow-up is folded into
    /// the resolved item so the entity keeps a single open item.
    pub async fn resolve_conflict_with<F>(
        &self,
        id: &str,
        decision: Resolution,
        extra: F,
    ) -> Result<Option<MutationItem>>
    where
        F: FnOnce(&MutationItem, Option<&MutationItem>) -> Result<WriteBatch> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let items = self.store.queue_items().await?;

        let mut item = items
            .iter()
            .find(|item| item.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("queue item {}", id)))?;
        if item.state != ItemState::Conflict {
            return Err(Error::InvalidState(format!(
                "queue item {} is {}, not in conflict",
                id, item.state
            )));
        }

        let follow_up = items
            .iter()
            .find(|other| {
                other.targets(item.entity_type, &item.entity_id)
                    && other.state != ItemState::Conflict
            })
            .cloned();

        let batch = extra(&item, follow_up.as_ref())?;

        match decision {
            Resolution::Local => {
                let mut batch = batch;
                if let Some(follow_up) = &follow_up {
                    item.coalesce(follow_up.action, follow_up.payload.clone(), now);
                    batch = batch.delete_queue_item(follow_up.id.clone());
                }
                item.reset_pending(now);
                item.server_payload = None;
                item.resolved_by = Some(Resolution::Local);
                self.store
                    .apply(batch.put_queue_item(item.clone()))
                    .await?;
                info!("Conflict {} resolved in favor of local data", id);
                Ok(Some(item))
            }
            Resolution::Server => {
                self.store.apply(batch.delete_queue_item(id)).await?;
                info!("Conflict {} resolved in favor of server data", id);
                Ok(None)
            }
        }
    }

    /// Items waiting for a conflict decision.
    pub async fn conflicts(&self) -> Result<Vec<MutationItem>> {
        Ok(self
            .store
            .queue_items()
            .await?
            .into_iter()
            .filter(|item| item.state == ItemState::Conflict)
            .collect())
    }

    /// Items that ran out of retries.
    pub async fn failed(&self) -> Result<Vec<MutationItem>> {
        let max_attempts = self.max_attempts();
        Ok(self
            .store
            .queue_items()
            .await?
            .into_iter()
            .filter(|item| item.is_exhausted(max_attempts))
            .collect())
    }

    /// Number of open items, not counting exhausted ones.
    pub async fn count_pending(&self) -> Result<usize> {
        let max_attempts = self.max_attempts();
        Ok(self
            .store
            .queue_items()
            .await?
            .iter()
            .filter(|item| !item.is_exhausted(max_attempts))
            .count())
    }

    /// Entity ids with an unsettled local write (`pending`, `syncing` or `error`).
    pub async fn outstanding_ids(&self, entity_type: EntityType) -> Result<HashSet<String>> {
        Ok(self
            .store
            .queue_items()
            .await?
            .into_iter()
            .filter(|item| item.entity_type == entity_type && item.state != ItemState::Conflict)
            .map(|item| item.entity_id)
            .collect())
    }

    /// Merge one pulled record into the local table.
    ///
    /// Runs under the queue lock, so a local write for the same entity either
    /// lands first (and the remote copy is skipped) or waits for the merge.
    /// An existing local record is only replaced when `remote_time` is
    /// strictly newer than its local marker.
    pub async fn apply_remote(
        &self,
        entity_type: EntityType,
        id: &str,
        remote: Record,
        remote_time: Option<DateTime<Utc>>,
    ) -> Result<RemoteMerge> {
        let _guard = self.write_lock.lock().await;

        if self.outstanding_ids(entity_type).await?.contains(id) {
            return Ok(RemoteMerge::KeptLocal);
        }

        match self.store.get(entity_type, id).await? {
            None => {
                self.store.add(entity_type, id, remote).await?;
                Ok(RemoteMerge::Inserted)
            }
            Some(local) => {
                let local_time = parse_timestamp(
                    local
                        .get(LOCAL_MODIFIED_FIELD)
                        .or_else(|| local.get(SERVER_TIMESTAMP_FIELD)),
                );
                let incoming = remote_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                if incoming > local_time {
                    self.store.put(entity_type, id, remote).await?;
                    Ok(RemoteMerge::Overwritten)
                } else {
                    Ok(RemoteMerge::Stale)
                }
            }
        }
    }

    /// Reset items left in `syncing` by an interrupted cycle.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();

        let mut batch = WriteBatch::new();
        for mut item in self.store.queue_items().await? {
            if item.state == ItemState::Syncing {
                item.state = ItemState::Pending;
                item.updated_at = now;
                batch = batch.put_queue_item(item);
            }
        }

        let recovered = batch.len();
        if recovered > 0 {
            self.store.apply(batch).await?;
            warn!("Recovered {} queue items orphaned in syncing state", recovered);
        }
        Ok(recovered)
    }

    /// Delete exhausted items whose last failure is older than `retention`.
    pub async fn cleanup_old(&self, retention: Duration) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::InvalidInput(format!("retention out of range: {}", e)))?;
        let cutoff = self.clock.now() - retention;
        let max_attempts = self.max_attempts();

        let mut batch = WriteBatch::new();
        for item in self.store.queue_items().await? {
            if item.is_exhausted(max_attempts) && item.updated_at < cutoff {
                batch = batch.delete_queue_item(item.id);
            }
        }

        let removed = batch.len();
        if removed > 0 {
            self.store.apply(batch).await?;
            info!("Cleaned up {} exhausted queue items", removed);
        }
        Ok(removed)
    }

    /// Give a failed item a fresh retry budget.
    pub async fn retry(&self, id: &str) -> Result<MutationItem> {
        let now = self.clock.now();
        self.update_item(id, |item| {
            if item.state == ItemState::Conflict {
                return Err(Error::Conflict(format!(
                    "queue item {} is in conflict, resolve it instead",
                    item.id
                )));
            }
            if item.state != ItemState::Error {
                return Err(Error::InvalidState(format!(
                    "queue item {} is {}, only failed items can be retried",
                    item.id, item.state
                )));
            }
            item.reset_pending(now);
            Ok(())
        })
        .await
    }

    /// Drop a queued write without delivering it.
    pub async fn discard(&self, id: &str) -> Result<MutationItem> {
        let _guard = self.write_lock.lock().await;
        let item = self
            .store
            .queue_item(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", id)))?;
        match item.state {
            ItemState::Syncing => Err(Error::InvalidState(format!(
                "queue item {} is being pushed",
                id
            ))),
            ItemState::Conflict => Err(Error::Conflict(format!(
                "queue item {} is in conflict, resolve it instead",
                id
            ))),
            ItemState::Pending | ItemState::Error => {
                self.store
                    .apply(WriteBatch::new().delete_queue_item(id))
                    .await?;
                info!("Discarded queue item {} ({}/{})", id, item.entity_type, item.entity_id);
                Ok(item)
            }
        }
    }

    /// Read-modify-write a single item under the queue lock.
    async fn update_item<F>(&self, id: &str, f: F) -> Result<MutationItem>
    where
        F: FnOnce(&mut MutationItem) -> Result<()> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut item = self
            .store
            .queue_item(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", id)))?;
        f(&mut item)?;
        self.store
            .apply(WriteBatch::new().put_queue_item(item.clone()))
            .await?;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use fieldsync_storage::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (MutationQueue, Arc<ManualClock>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let retry = RetryScheduler::new(
            vec![Duration::from_secs(10), Duration::from_secs(60), Duration::from_secs(300)],
            3,
        )
        .with_jitter_ratio(0.0);
        let queue = MutationQueue::new(store.clone(), retry, clock.clone());
        (queue, clock, store)
    }

    #[tokio::test]
    async fn test_update_then_delete_collapses_to_delete() {
        let (queue, _, _) = setup();
        queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"nombre": "Norte"})))
            .await
            .unwrap();
        queue
            .enqueue(EntityType::Zona, "z1", Action::Delete, Record::new())
            .await
            .unwrap();

        let items = queue.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, Action::Delete);
    }

    #[tokio::test]
    async fn test_create_then_update_stays_create() {
        let (queue, _, _) = setup();
        let first = queue
            .enqueue(EntityType::Cultivo, "c1", Action::Create, record(json!({"nombre": "Maiz"})))
            .await
            .unwrap();
        let second = queue
            .enqueue(EntityType::Cultivo, "c1", Action::Update, record(json!({"hectareas": 3})))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.action, Action::Create);
        assert_eq!(second.payload, record(json!({"nombre": "Maiz", "hectareas": 3})));
    }

    #[tokio::test]
    async fn test_retry_progression_until_exhausted() {
        let (queue, clock, _) = setup();
        let item = queue
            .enqueue(EntityType::Riego, "r1", Action::Update, Record::new())
            .await
            .unwrap();

        let mut previous = None;
        for attempt in 1..=2 {
            queue.mark_syncing(&item.id).await.unwrap();
            let failed = queue.mark_error(&item.id, "offline").await.unwrap();
            assert_eq!(failed.attempts, attempt);
            let next = failed.next_retry_at.expect("retry scheduled");
            assert!(previous.map_or(true, |p| next > p));
            previous = Some(next);

            assert!(queue.due_for_sync().await.unwrap().is_empty());
            clock.set(next);
            assert_eq!(queue.due_for_sync().await.unwrap().len(), 1);
        }

        queue.mark_syncing(&item.id).await.unwrap();
        let frozen = queue.mark_error(&item.id, "offline").await.unwrap();
        assert_eq!(frozen.attempts, 3);
        assert!(frozen.next_retry_at.is_none());
        assert!(queue.due_for_sync().await.unwrap().is_empty());
        assert_eq!(queue.count_pending().await.unwrap(), 0);
        assert_eq!(queue.failed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_into_exhausted_item_gets_fresh_budget() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Riego, "r1", Action::Update, record(json!({"litros": 10})))
            .await
            .unwrap();
        for _ in 0..3 {
            queue.mark_syncing(&item.id).await.unwrap();
            queue.mark_error(&item.id, "offline").await.unwrap();
        }
        assert!(queue.due_for_sync().await.unwrap().is_empty());

        let merged = queue
            .enqueue(EntityType::Riego, "r1", Action::Update, record(json!({"litros": 99})))
            .await
            .unwrap();

        assert_eq!(merged.id, item.id);
        assert_eq!(merged.state, ItemState::Pending);
        assert_eq!(merged.attempts, 0);
        assert_eq!(merged.payload, record(json!({"litros": 99})));
        let due = queue.due_for_sync().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, item.id);
        assert!(queue.failed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_into_retrying_item_keeps_schedule() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Riego, "r1", Action::Update, Record::new())
            .await
            .unwrap();
        queue.mark_syncing(&item.id).await.unwrap();
        let failed = queue.mark_error(&item.id, "offline").await.unwrap();

        let merged = queue
            .enqueue(EntityType::Riego, "r1", Action::Update, record(json!({"litros": 5})))
            .await
            .unwrap();

        assert_eq!(merged.state, ItemState::Error);
        assert_eq!(merged.attempts, 1);
        assert_eq!(merged.next_retry_at, failed.next_retry_at);
    }

    #[tokio::test]
    async fn test_apply_remote_merges_by_timestamp_and_skips_open_items() {
        let (queue, _, store) = setup();
        let remote = |nombre: &str| record(json!({"id": "z1", "nombre": nombre}));
        let ts = |s: &str| Some(s.parse::<DateTime<Utc>>().unwrap());

        let merge = queue
            .apply_remote(EntityType::Zona, "z1", remote("A"), ts("2024-06-01T08:00:00Z"))
            .await
            .unwrap();
        assert_eq!(merge, RemoteMerge::Inserted);

        store
            .put(
                EntityType::Zona,
                "z1",
                record(json!({"id": "z1", "nombre": "B", "_last_modified": "2024-06-01T09:00:00Z"})),
            )
            .await
            .unwrap();
        let merge = queue
            .apply_remote(EntityType::Zona, "z1", remote("C"), ts("2024-06-01T09:00:00Z"))
            .await
            .unwrap();
        assert_eq!(merge, RemoteMerge::Stale);
        assert!(!merge.wrote());

        let merge = queue
            .apply_remote(EntityType::Zona, "z1", remote("D"), ts("2024-06-01T10:00:00Z"))
            .await
            .unwrap();
        assert_eq!(merge, RemoteMerge::Overwritten);

        queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"nombre": "E"})))
            .await
            .unwrap();
        let merge = queue
            .apply_remote(EntityType::Zona, "z1", remote("F"), ts("2030-01-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(merge, RemoteMerge::KeptLocal);
        let local = store.get(EntityType::Zona, "z1").await.unwrap().unwrap();
        assert_eq!(local.get("nombre"), Some(&json!("D")));
    }

    #[tokio::test]
    async fn test_conflict_is_not_coalesced_into() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"nombre": "Norte"})))
            .await
            .unwrap();
        queue.mark_syncing(&item.id).await.unwrap();
        queue
            .mark_conflict(&item.id, record(json!({"id": "z1", "nombre": "Sur"})))
            .await
            .unwrap();

        let follow_up = queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"area": 5})))
            .await
            .unwrap();
        assert_ne!(follow_up.id, item.id);
        assert_eq!(queue.items().await.unwrap().len(), 2);

        // Held back while the conflict is open.
        assert!(queue.due_for_sync().await.unwrap().is_empty());
        assert!(queue.outstanding_ids(EntityType::Zona).await.unwrap().contains("z1"));
    }

    #[tokio::test]
    async fn test_resolve_local_folds_follow_up() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"nombre": "Norte"})))
            .await
            .unwrap();
        queue.mark_syncing(&item.id).await.unwrap();
        queue.mark_error(&item.id, "timeout").await.unwrap();
        queue.mark_syncing(&item.id).await.unwrap();
        queue
            .mark_conflict(&item.id, record(json!({"nombre": "Sur"})))
            .await
            .unwrap();
        queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"area": 5})))
            .await
            .unwrap();

        let resolved = queue
            .resolve_conflict(&item.id, Resolution::Local)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.state, ItemState::Pending);
        assert_eq!(resolved.attempts, 0);
        assert!(resolved.server_payload.is_none());
        assert_eq!(resolved.resolved_by, Some(Resolution::Local));
        assert_eq!(resolved.payload, record(json!({"nombre": "Norte", "area": 5})));

        let items = queue.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(queue.due_for_sync().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_requires_conflict_state() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Gasto, "g1", Action::Create, Record::new())
            .await
            .unwrap();
        let err = queue
            .resolve_conflict(&item.id, Resolution::Server)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_complete_push_requeues_revised_item() {
        let (queue, _, store) = setup();
        let item = queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"nombre": "Norte"})))
            .await
            .unwrap();
        let claimed = queue.mark_syncing(&item.id).await.unwrap();

        queue
            .enqueue(EntityType::Zona, "z1", Action::Update, record(json!({"area": 9})))
            .await
            .unwrap();

        let outcome = queue
            .complete_push(&item.id, claimed.revision, Some(record(json!({"id": "z1"}))))
            .await
            .unwrap();
        assert_eq!(outcome, Completion::Requeued);

        let requeued = queue.get(&item.id).await.unwrap().unwrap();
        assert_eq!(requeued.state, ItemState::Pending);
        assert!(store.get(EntityType::Zona, "z1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_push_applies_canonical_data() {
        let (queue, _, store) = setup();
        let item = queue
            .enqueue(EntityType::Zona, "z1", Action::Create, record(json!({"nombre": "Norte"})))
            .await
            .unwrap();
        let claimed = queue.mark_syncing(&item.id).await.unwrap();

        let canonical = record(json!({"id": "z1", "nombre": "Norte", "updated_at": "2024-01-01T00:00:00Z"}));
        let outcome = queue
            .complete_push(&item.id, claimed.revision, Some(canonical.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, Completion::Removed);
        assert!(queue.get(&item.id).await.unwrap().is_none());
        assert_eq!(store.get(EntityType::Zona, "z1").await.unwrap(), Some(canonical));
    }

    #[tokio::test]
    async fn test_recover_orphans() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Cosecha, "k1", Action::Update, Record::new())
            .await
            .unwrap();
        queue.mark_syncing(&item.id).await.unwrap();

        assert_eq!(queue.recover_orphans().await.unwrap(), 1);
        assert_eq!(queue.get(&item.id).await.unwrap().unwrap().state, ItemState::Pending);
        assert_eq!(queue.recover_orphans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_exhausted_items() {
        let (queue, clock, _) = setup();
        let dead = queue
            .enqueue(EntityType::Riego, "r1", Action::Update, Record::new())
            .await
            .unwrap();
        let alive = queue
            .enqueue(EntityType::Riego, "r2", Action::Update, Record::new())
            .await
            .unwrap();
        for _ in 0..3 {
            queue.mark_error(&dead.id, "offline").await.unwrap();
        }
        queue.mark_error(&alive.id, "offline").await.unwrap();

        let retention = Duration::from_secs(3600);
        assert_eq!(queue.cleanup_old(retention).await.unwrap(), 0);

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(queue.cleanup_old(retention).await.unwrap(), 1);
        assert!(queue.get(&dead.id).await.unwrap().is_none());
        assert!(queue.get(&alive.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_manual_retry_and_discard() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Gasto, "g1", Action::Create, Record::new())
            .await
            .unwrap();
        assert!(queue.retry(&item.id).await.is_err());

        for _ in 0..3 {
            queue.mark_error(&item.id, "rejected").await.unwrap();
        }
        let revived = queue.retry(&item.id).await.unwrap();
        assert_eq!(revived.attempts, 0);
        assert_eq!(queue.due_for_sync().await.unwrap().len(), 1);

        queue.discard(&item.id).await.unwrap();
        assert!(queue.items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_items_refuse_retry_and_discard() {
        let (queue, _, _) = setup();
        let item = queue
            .enqueue(EntityType::Zona, "z1", Action::Update, Record::new())
            .await
            .unwrap();
        queue.mark_syncing(&item.id).await.unwrap();
        queue
            .mark_conflict(&item.id, record(json!({"nombre": "Sur"})))
            .await
            .unwrap();

        assert!(matches!(queue.retry(&item.id).await, Err(Error::Conflict(_))));
        assert!(matches!(queue.discard(&item.id).await, Err(Error::Conflict(_))));
        assert_eq!(queue.conflicts().await.unwrap().len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Write(usize, Action),
        Conflict(usize),
        Resolve(usize, Resolution),
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        let action = prop_oneof![Just(Action::Create), Just(Action::Update), Just(Action::Delete)];
        let resolution = prop_oneof![Just(Resolution::Local), Just(Resolution::Server)];
        prop_oneof![
            4 => (0..3usize, action).prop_map(|(id, a)| Step::Write(id, a)),
            1 => (0..3usize).prop_map(Step::Conflict),
            1 => (0..3usize, resolution).prop_map(|(id, r)| Step::Resolve(id, r)),
        ]
    }

    proptest! {
        #[test]
        fn prop_one_open_item_per_entity(steps in proptest::collection::vec(step_strategy(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let (queue, _, _) = setup();
                for step in steps {
                    match step {
                        Step::Write(id, action) => {
                            let mut payload = Record::new();
                            payload.insert(format!("f{}", id), json!(id));
                            queue.enqueue(EntityType::Zona, &format!("z{}", id), action, payload).await.unwrap();
                        }
                        Step::Conflict(id) => {
                            let open = queue.items().await.unwrap().into_iter().find(|i| {
                                i.entity_id == format!("z{}", id) && i.state != ItemState::Conflict
                            });
                            let already = queue.conflicts().await.unwrap().iter().any(|i| i.entity_id == format!("z{}", id));
                            if let (Some(item), false) = (open, already) {
                                queue.mark_conflict(&item.id, Record::new()).await.unwrap();
                            }
                        }
                        Step::Resolve(id, decision) => {
                            let conflict = queue.conflicts().await.unwrap().into_iter().find(|i| i.entity_id == format!("z{}", id));
                            if let Some(item) = conflict {
                                queue.resolve_conflict(&item.id, decision).await.unwrap();
                            }
                        }
                    }

                    let items = queue.items().await.unwrap();
                    for id in 0..3 {
                        let open = items
                            .iter()
                            .filter(|i| i.entity_id == format!("z{}", id) && i.state != ItemState::Conflict)
                            .count();
                        assert!(open <= 1, "entity z{} has {} open items", id, open);
                    }
                }
            });
        }
    }
}
