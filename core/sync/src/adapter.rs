//! Remote adapter trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldsync_common::{Action, EntityType, Record, Result};

/// Outcome of pushing one mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    /// Canonical record as stored by the remote, if it returns one.
    #[serde(default)]
    pub data: Option<Record>,
    #[serde(default)]
    pub error: Option<String>,
    /// The remote rejected the write in favor of its own data.
    #[serde(default)]
    pub conflict: bool,
    /// Authoritative record accompanying a conflict.
    #[serde(default)]
    pub server_data: Option<Record>,
}

impl PushResponse {
    pub fn ok(data: Option<Record>) -> Self {
        Self {
            success: true,
            data,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn conflict(server_data: Record) -> Self {
        Self {
            success: false,
            conflict: true,
            server_data: Some(server_data),
            ..Self::default()
        }
    }
}

/// Outcome of pulling one entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub success: bool,
    /// Records changed since the requested watermark.
    #[serde(default)]
    pub data: Vec<Record>,
    /// Watermark to resume from next time.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullResponse {
    pub fn ok(data: Vec<Record>, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            data,
            last_modified,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Network transport to the authoritative remote store.
///
/// Supplied by the embedding application and injected into the engine.
/// An `Err` return is treated like any other network failure.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter name (e.g., "http"), used in logs.
    fn name(&self) -> &str;

    /// Deliver one mutation.
    ///
    /// # Contract
    /// - Must be safe to repeat: the engine may push the same mutation again
    ///   after a crash or a timeout whose call actually went through. Remote
    ///   writes therefore need overwrite (upsert / idempotent delete) semantics.
    async fn push(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: Action,
        payload: &Record,
    ) -> Result<PushResponse>;

    /// Fetch records of one entity type modified after `since`.
    async fn pull(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<PullResponse>;

    /// Whether the remote is reachable right now.
    async fn is_available(&self) -> bool;
}
