//! Core sync engine that orchestrates one sync cycle.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use fieldsync_common::{
    parse_timestamp, record_id, Action, EntityType, Error, MutationItem, Record, Resolution,
    Result, ID_FIELD, LOCAL_MODIFIED_FIELD, SERVER_TIMESTAMP_FIELD,
};
use fieldsync_storage::{LocalStore, WriteBatch};

use crate::adapter::{Adapter, PushResponse};
use crate::checkpoint::Checkpoint;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::{ConflictStore, ResolutionResult};
use crate::lock::{LockGuard, NamedLock, TryLock};
use crate::queue::{Completion, MutationQueue, RemoteMerge};
use crate::retry::RetryScheduler;
use crate::state::{CyclePhase, CycleSummary, SyncStatus};

/// How a single push attempt ended.
enum PushOutcome {
    Delivered,
    Conflict,
    Failed,
}

/// Main sync engine reconciling the local queue with the remote store.
///
/// The engine owns no timer: callers decide when to invoke
/// [`run_cycle`](Self::run_cycle).
pub struct SyncEngine {
    /// Remote transport.
    adapter: Arc<dyn Adapter>,
    /// Local entity tables and metadata.
    store: Arc<dyn LocalStore>,
    queue: Arc<MutationQueue>,
    conflicts: ConflictStore,
    checkpoint: Checkpoint,
    /// Single-flight guard for cycles.
    lock: Arc<dyn TryLock>,
    clock: Arc<dyn Clock>,
    phase: RwLock<CyclePhase>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create a new sync engine with an in-process cycle lock and the system clock.
    pub fn new(
        adapter: Arc<dyn Adapter>,
        store: Arc<dyn LocalStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let lock = Arc::new(NamedLock::new(config.lock_name.clone()));
        Self::from_parts(adapter, store, config, lock, Arc::new(SystemClock))
    }

    /// Create a sync engine with an explicit lock and clock.
    pub fn from_parts(
        adapter: Arc<dyn Adapter>,
        store: Arc<dyn LocalStore>,
        config: SyncConfig,
        lock: Arc<dyn TryLock>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let retry = RetryScheduler::from_config(&config);
        let queue = Arc::new(MutationQueue::new(store.clone(), retry, clock.clone()));

        Ok(Self {
            conflicts: ConflictStore::new(queue.clone(), clock.clone()),
            checkpoint: Checkpoint::new(store.clone()),
            adapter,
            store,
            queue,
            lock,
            clock,
            phase: RwLock::new(CyclePhase::Idle),
            config,
        })
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Phase of the cycle currently running, `Idle` between cycles.
    pub async fn phase(&self) -> CyclePhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write().await = phase;
    }

    /// Apply a local write to the entity table and queue it for delivery.
    ///
    /// Both writes are committed in one batch. The stored record is stamped
    /// with the local modification time.
    pub async fn write_local(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: Action,
        payload: Record,
    ) -> Result<MutationItem> {
        let extra = match action {
            Action::Delete => WriteBatch::new().delete_record(entity_type, entity_id),
            Action::Create | Action::Update => {
                let mut record = match action {
                    Action::Update => self
                        .store
                        .get(entity_type, entity_id)
                        .await?
                        .unwrap_or_default(),
                    _ => Record::new(),
                };
                record.extend(payload.clone());
                record.insert(ID_FIELD.to_string(), Value::String(entity_id.to_string()));
                record.insert(
                    LOCAL_MODIFIED_FIELD.to_string(),
                    Value::String(self.clock.now().to_rfc3339()),
                );
                WriteBatch::new().put_record(entity_type, entity_id, record)
            }
        };

        self.queue
            .enqueue_with(entity_type, entity_id, action, payload, extra)
            .await
    }

    /// Resolve a conflict; see [`ConflictStore::resolve`].
    pub async fn resolve_conflict(
        &self,
        id: &str,
        decision: Resolution,
    ) -> Result<ResolutionResult> {
        self.conflicts.resolve(id, decision).await
    }

    /// Snapshot of queue and checkpoint state.
    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            pending: self.queue.count_pending().await?,
            conflicts: self.conflicts.count().await?,
            failed: self.queue.failed().await?.len(),
            checkpoint: self.checkpoint.load().await?,
            phase: self.phase().await,
        })
    }

    /// Run one sync cycle.
    ///
    /// Never fails: every problem is counted in the returned summary. Returns
    /// an empty summary without doing anything if another cycle holds the
    /// lock or the remote is unreachable.
    pub async fn run_cycle(&self) -> CycleSummary {
        let Some(_guard) = LockGuard::acquire(self.lock.as_ref()) else {
            debug!("Sync cycle skipped, lock '{}' is held", self.lock.name());
            return CycleSummary::default();
        };

        let summary = self.run_locked().await;
        self.set_phase(CyclePhase::Idle).await;
        summary
    }

    async fn run_locked(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();

        if !self.adapter_available().await {
            info!("Adapter '{}' unavailable, skipping sync cycle", self.adapter.name());
            return summary;
        }

        info!("Starting sync cycle via '{}'", self.adapter.name());

        self.set_phase(CyclePhase::RecoveringOrphans).await;
        if let Err(e) = self.queue.recover_orphans().await {
            error!("Orphan recovery failed: {}", e);
            summary.errors += 1;
        }

        self.set_phase(CyclePhase::Pushing).await;
        self.push_phase(&mut summary).await;

        self.set_phase(CyclePhase::Pulling).await;
        self.pull_phase(&mut summary).await;

        self.set_phase(CyclePhase::Cleanup).await;
        self.cleanup_phase().await;

        info!("Sync cycle finished: {}", summary);
        summary
    }

    async fn adapter_available(&self) -> bool {
        let adapter = self.adapter.clone();
        let check = with_deadline(self.config.push_timeout(), "availability check", async move {
            Ok(adapter.is_available().await)
        });
        match check.await {
            Ok(available) => available,
            Err(e) => {
                warn!("Availability check failed: {}", e);
                false
            }
        }
    }

    async fn push_phase(&self, summary: &mut CycleSummary) {
        let due = match self.queue.due_for_sync().await {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to read due queue items: {}", e);
                summary.errors += 1;
                return;
            }
        };

        debug!("{} queue items due for push", due.len());
        for item in due {
            match self.push_item(&item).await {
                Ok(PushOutcome::Delivered) => summary.pushed += 1,
                Ok(PushOutcome::Conflict) => summary.conflicts += 1,
                Ok(PushOutcome::Failed) => summary.errors += 1,
                Err(e) => {
                    error!("Local storage error on queue item {}: {}", item.id, e);
                    summary.errors += 1;
                    // Leave the item retry-accounted if the store still answers;
                    // otherwise orphan recovery picks it up next cycle.
                    if let Err(e) = self.queue.mark_error(&item.id, &e.to_string()).await {
                        debug!("Could not record failure of {}: {}", item.id, e);
                    }
                }
            }
        }
    }

    /// Push one item and settle its queue state.
    ///
    /// Remote failures become queue transitions; only local storage errors
    /// are returned.
    async fn push_item(&self, item: &MutationItem) -> Result<PushOutcome> {
        let claimed = self.queue.mark_syncing(&item.id).await?;

        let adapter = self.adapter.clone();
        let (entity_type, action) = (claimed.entity_type, claimed.action);
        let entity_id = claimed.entity_id.clone();
        let payload = claimed.payload.clone();
        let response = with_deadline(self.config.push_timeout(), "push", async move {
            adapter.push(entity_type, &entity_id, action, &payload).await
        })
        .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                if e.is_retryable() {
                    debug!("Push of {} failed: {}", claimed.id, e);
                } else {
                    warn!("Push of {} failed: {}", claimed.id, e);
                }
                self.queue.mark_error(&claimed.id, &e.to_string()).await?;
                return Ok(PushOutcome::Failed);
            }
        };

        match response {
            PushResponse {
                conflict: true,
                server_data: Some(server_data),
                ..
            } => {
                self.queue.mark_conflict(&claimed.id, server_data).await?;
                Ok(PushOutcome::Conflict)
            }
            PushResponse { conflict: true, .. } => {
                self.queue
                    .mark_error(&claimed.id, "conflict reported without server data")
                    .await?;
                Ok(PushOutcome::Failed)
            }
            PushResponse {
                success: false,
                error,
                ..
            } => {
                let message = error.unwrap_or_else(|| "push rejected".to_string());
                self.queue.mark_error(&claimed.id, &message).await?;
                Ok(PushOutcome::Failed)
            }
            PushResponse { data, .. } => {
                let canonical = data
                    .filter(|_| action != Action::Delete)
                    .map(|record| prepare_remote(record, &claimed.entity_id));
                match self
                    .queue
                    .complete_push(&claimed.id, claimed.revision, canonical)
                    .await?
                {
                    Completion::Removed => {
                        debug!("Pushed {} {}/{}", action, entity_type, claimed.entity_id)
                    }
                    Completion::Requeued => {
                        debug!("Pushed {} but a newer edit is queued", claimed.id)
                    }
                    Completion::Missing => {
                        debug!("Queue item {} was removed during push", claimed.id)
                    }
                }
                Ok(PushOutcome::Delivered)
            }
        }
    }

    async fn pull_phase(&self, summary: &mut CycleSummary) {
        let since = match self.checkpoint.load().await {
            Ok(since) => since,
            Err(e) => {
                error!("Failed to read checkpoint: {}", e);
                summary.errors += 1;
                return;
            }
        };

        let mut all_succeeded = true;
        let mut watermark: Option<DateTime<Utc>> = None;

        for entity_type in EntityType::ALL {
            match self.pull_entity(entity_type, since).await {
                Ok((pulled, last_modified)) => {
                    summary.pulled += pulled;
                    watermark = watermark.max(last_modified);
                }
                Err(e) => {
                    warn!("Pull of {} failed: {}", entity_type, e);
                    summary.errors += 1;
                    all_succeeded = false;
                }
            }
        }

        if !all_succeeded {
            info!("Checkpoint not advanced, at least one pull failed");
            return;
        }
        if let Some(watermark) = watermark {
            if let Err(e) = self.checkpoint.advance(watermark).await {
                error!("Failed to advance checkpoint: {}", e);
                summary.errors += 1;
            }
        }
    }

    /// Pull and merge one entity type. Returns the number of records written
    /// and the watermark reached.
    async fn pull_entity(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<(usize, Option<DateTime<Utc>>)> {
        let adapter = self.adapter.clone();
        let response = with_deadline(self.config.pull_timeout(), "pull", async move {
            adapter.pull(entity_type, since).await
        })
        .await?;

        if !response.success {
            return Err(Error::Network(
                response
                    .error
                    .unwrap_or_else(|| format!("pull of {} rejected", entity_type)),
            ));
        }

        let mut pulled = 0;
        let mut newest: Option<DateTime<Utc>> = None;

        for remote in response.data {
            let remote_time = remote_timestamp(&remote);
            newest = newest.max(remote_time);

            let Some(id) = record_id(&remote) else {
                warn!("Skipping {} record without id", entity_type);
                continue;
            };

            let remote = prepare_remote(remote, &id);
            let merge = self
                .queue
                .apply_remote(entity_type, &id, remote, remote_time)
                .await?;
            if merge == RemoteMerge::KeptLocal {
                debug!("Local write pending for {}/{}, keeping local copy", entity_type, id);
            }
            if merge.wrote() {
                pulled += 1;
            }
        }

        debug!("Pulled {} {} records", pulled, entity_type);
        Ok((pulled, response.last_modified.or(newest)))
    }

    async fn cleanup_phase(&self) {
        match self.queue.cleanup_old(self.config.cleanup_retention()).await {
            Ok(0) => {}
            Ok(removed) => debug!("Cleanup removed {} items", removed),
            Err(e) => warn!("Cleanup failed: {}", e),
        }
    }
}

/// Await a remote call for at most `deadline`.
///
/// The call runs as its own task. On timeout the engine stops waiting and
/// the task is detached: it may still complete, but its result is dropped.
async fn with_deadline<T, F>(deadline: Duration, what: &str, call: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handle = tokio::spawn(call);
    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(Error::Network(format!("{} task failed: {}", what, e))),
        Err(_) => Err(Error::Timeout(format!(
            "{} timed out after {:?}",
            what, deadline
        ))),
    }
}

/// Remote modification time of a record, if it carries a readable one.
fn remote_timestamp(record: &Record) -> Option<DateTime<Utc>> {
    let value = record.get(SERVER_TIMESTAMP_FIELD)?;
    let parsed = parse_timestamp(Some(value));
    (parsed != DateTime::<Utc>::UNIX_EPOCH).then_some(parsed)
}

/// Shape a remote record for the local table: ensure the id field and
/// carry the remote timestamp into the local modification marker.
fn prepare_remote(mut record: Record, entity_id: &str) -> Record {
    record
        .entry(ID_FIELD)
        .or_insert_with(|| Value::String(entity_id.to_string()));
    if let Some(at) = remote_timestamp(&record) {
        record.insert(
            LOCAL_MODIFIED_FIELD.to_string(),
            Value::String(at.to_rfc3339()),
        );
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_prepare_remote_stamps_marker() {
        let prepared = prepare_remote(
            record(json!({"nombre": "Norte", "updated_at": "2024-06-01T08:00:00Z"})),
            "z1",
        );
        assert_eq!(prepared.get(ID_FIELD), Some(&json!("z1")));
        assert_eq!(
            parse_timestamp(prepared.get(LOCAL_MODIFIED_FIELD)),
            parse_timestamp(Some(&json!("2024-06-01T08:00:00Z")))
        );
    }

    #[test]
    fn test_prepare_remote_without_timestamp() {
        let prepared = prepare_remote(record(json!({"id": "z9", "updated_at": "soon"})), "z1");
        assert_eq!(prepared.get(ID_FIELD), Some(&json!("z9")));
        assert!(!prepared.contains_key(LOCAL_MODIFIED_FIELD));
    }

    #[tokio::test]
    async fn test_deadline_detaches_slow_call() {
        let result: Result<()> = with_deadline(Duration::from_millis(20), "push", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_deadline_passes_errors_through() {
        let result: Result<()> = with_deadline(Duration::from_secs(1), "pull", async {
            Err(Error::Network("refused".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
