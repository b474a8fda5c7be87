//! SQLite-backed local store.
//!
//! Persists entity tables, the mutation queue and sync metadata in a single
//! database file. Every [`WriteBatch`] runs inside one SQL transaction.

use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::store::{LocalStore, WriteBatch, WriteOp};
use fieldsync_common::{EntityType, Error, MutationItem, Record, Result};

fn db_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Local store using SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;
        Self::init_schema(&conn).map_err(db_err)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init_schema(&conn).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        let mut ddl = String::from(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_queue_entity
                ON sync_queue(entity_type, entity_id);

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        );
        for entity_type in EntityType::ALL {
            ddl.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, data TEXT NOT NULL);\n",
                entity_type.as_str()
            ));
        }
        conn.execute_batch(&ddl)
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite task failed: {}", e)))?
    }
}

fn select_record(conn: &Connection, entity_type: EntityType, id: &str) -> Result<Option<Record>> {
    let sql = format!("SELECT data FROM {} WHERE id = ?1", entity_type.as_str());
    let data: Option<String> = conn
        .query_row(&sql, [id], |row| row.get(0))
        .optional()
        .map_err(db_err)?;
    match data {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

fn upsert_record(tx: &Transaction<'_>, entity_type: EntityType, id: &str, record: &Record) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {} (id, data) VALUES (?1, ?2)",
        entity_type.as_str()
    );
    let data = serde_json::to_string(record)?;
    tx.execute(&sql, params![id, data]).map_err(db_err)?;
    Ok(())
}

fn apply_op(tx: &Transaction<'_>, op: WriteOp) -> Result<()> {
    match op {
        WriteOp::PutRecord {
            entity_type,
            id,
            record,
        } => upsert_record(tx, entity_type, &id, &record),
        WriteOp::AddRecord {
            entity_type,
            id,
            record,
        } => {
            if select_record(tx, entity_type, &id)?.is_some() {
                return Err(Error::AlreadyExists(format!("{}/{}", entity_type, id)));
            }
            upsert_record(tx, entity_type, &id, &record)
        }
        WriteOp::UpdateRecord {
            entity_type,
            id,
            changes,
        } => {
            let mut existing = select_record(tx, entity_type, &id)?
                .ok_or_else(|| Error::NotFound(format!("{}/{}", entity_type, id)))?;
            existing.extend(changes);
            upsert_record(tx, entity_type, &id, &existing)
        }
        WriteOp::DeleteRecord { entity_type, id } => {
            let sql = format!("DELETE FROM {} WHERE id = ?1", entity_type.as_str());
            tx.execute(&sql, [&id]).map_err(db_err)?;
            Ok(())
        }
        WriteOp::PutQueueItem(item) => {
            let body = serde_json::to_string(&item)?;
            tx.execute(
                r#"
                INSERT OR REPLACE INTO sync_queue
                (id, entity_type, entity_id, state, created_at, body)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    item.id,
                    item.entity_type.as_str(),
                    item.entity_id,
                    item.state.as_str(),
                    item.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    body,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        }
        WriteOp::DeleteQueueItem(id) => {
            tx.execute("DELETE FROM sync_queue WHERE id = ?1", [&id])
                .map_err(db_err)?;
            Ok(())
        }
        WriteOp::SetMeta { key, value } => {
            tx.execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(db_err)?;
            Ok(())
        }
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>> {
        let id = id.to_string();
        self.with_conn(move |conn| select_record(conn, entity_type, &id))
            .await
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Record>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT data FROM {} ORDER BY id", entity_type.as_str());
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut records = Vec::new();
            for data in rows {
                let data = data.map_err(db_err)?;
                records.push(serde_json::from_str(&data)?);
            }
            Ok(records)
        })
        .await
    }

    async fn queue_items(&self) -> Result<Vec<MutationItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM sync_queue ORDER BY created_at, id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut items = Vec::new();
            for body in rows {
                let body = body.map_err(db_err)?;
                items.push(serde_json::from_str(&body)?);
            }
            Ok(items)
        })
        .await
    }

    async fn queue_item(&self, id: &str) -> Result<Option<MutationItem>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row("SELECT body FROM sync_queue WHERE id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)?;
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM sync_meta WHERE key = ?1", [&key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!("Applying batch of {} writes", batch.len());
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for op in batch.into_ops() {
                apply_op(&tx, op)?;
            }
            tx.commit().map_err(db_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use fieldsync_common::{Action, ItemState};
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_records_and_queue_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fieldsync.db");

        let item = MutationItem::new(
            EntityType::Zona,
            "z1",
            Action::Create,
            record(json!({"nombre": "Norte"})),
            Utc::now(),
        );
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .apply(
                    WriteBatch::new()
                        .put_record(EntityType::Zona, "z1", record(json!({"id": "z1", "nombre": "Norte"})))
                        .put_queue_item(item.clone())
                        .set_meta("checkpoint", "2024-01-01T00:00:00Z"),
                )
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let stored = store.get(EntityType::Zona, "z1").await.unwrap().unwrap();
        assert_eq!(stored.get("nombre"), Some(&json!("Norte")));
        assert_eq!(store.queue_item(&item.id).await.unwrap(), Some(item));
        assert_eq!(
            store.get_meta("checkpoint").await.unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = WriteBatch::new()
            .put_record(EntityType::Gasto, "g1", record(json!({"id": "g1"})))
            .update_record(EntityType::Gasto, "missing", Record::new());

        let err = store.apply(batch).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.get(EntityType::Gasto, "g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_items_ordered_by_creation() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let mut older = MutationItem::new(EntityType::Riego, "r1", Action::Update, Record::new(), now - Duration::seconds(10));
        older.state = ItemState::Error;
        let newer = MutationItem::new(EntityType::Riego, "r2", Action::Update, Record::new(), now);

        store
            .apply(WriteBatch::new().put_queue_item(newer.clone()).put_queue_item(older.clone()))
            .await
            .unwrap();

        let items = store.queue_items().await.unwrap();
        assert_eq!(items, vec![older, newer]);
    }

    #[tokio::test]
    async fn test_add_and_update() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .add(EntityType::Cultivo, "c1", record(json!({"id": "c1", "nombre": "Trigo"})))
            .await
            .unwrap();
        assert!(matches!(
            store.add(EntityType::Cultivo, "c1", Record::new()).await,
            Err(Error::AlreadyExists(_))
        ));

        store
            .update(EntityType::Cultivo, "c1", record(json!({"hectareas": 4})))
            .await
            .unwrap();
        let listed = store.list(EntityType::Cultivo).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].get("hectareas"), Some(&json!(4)));
        assert_eq!(listed[0].get("nombre"), Some(&json!("Trigo")));
    }
}
