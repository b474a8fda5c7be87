//! Common types used throughout fieldsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A record or payload: a flat key/value map of entity fields.
pub type Record = serde_json::Map<String, Value>;

/// Field holding a record's identifier.
pub const ID_FIELD: &str = "id";
/// Field the remote store stamps with its own modification time.
pub const SERVER_TIMESTAMP_FIELD: &str = "updated_at";
/// Field the local store stamps whenever a record is written on this device.
pub const LOCAL_MODIFIED_FIELD: &str = "_last_modified";

/// The closed set of synchronized entity kinds.
///
/// Each kind maps to one local table and one remote change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Zona,
    Cultivo,
    Riego,
    Cosecha,
    Gasto,
}

impl EntityType {
    /// Every entity type, in pull order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Zona,
        EntityType::Cultivo,
        EntityType::Riego,
        EntityType::Cosecha,
        EntityType::Gasto,
    ];

    /// Table / collection name shared by the local and remote stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Zona => "zona",
            EntityType::Cultivo => "cultivo",
            EntityType::Riego => "riego",
            EntityType::Cosecha => "cosecha",
            EntityType::Gasto => "gasto",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown entity type '{}'", s)))
    }
}

/// Kind of local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Action resulting from folding `incoming` into a queued `self`.
    ///
    /// A delete always wins; an uncommitted create stays a create.
    pub fn coalesce(self, incoming: Action) -> Action {
        match (self, incoming) {
            (_, Action::Delete) => Action::Delete,
            (Action::Create, _) => Action::Create,
            (_, incoming) => incoming,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(crate::Error::InvalidInput(format!("Unknown action '{}'", other))),
        }
    }
}

/// Queue state of a single mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Waiting to be pushed.
    Pending,
    /// Handed to the adapter by the current (or a crashed) cycle.
    Syncing,
    /// Last push failed; see `attempts` and `next_retry_at`.
    Error,
    /// Rejected by the remote in favor of `server_payload`.
    Conflict,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Syncing => "syncing",
            ItemState::Error => "error",
            ItemState::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side wins a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local payload and push it again.
    Local,
    /// Adopt the remote payload and drop the local edit.
    Server,
}

impl FromStr for Resolution {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "local" => Ok(Resolution::Local),
            "server" => Ok(Resolution::Server),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown resolution '{}' (expected 'local' or 'server')",
                other
            ))),
        }
    }
}

/// A queued local write awaiting delivery to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationItem {
    /// Queue row identifier (not the entity's id).
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: Action,
    /// Fields being written.
    pub payload: Record,
    pub state: ItemState,
    /// Number of failed push attempts.
    pub attempts: u32,
    /// When an `error` item becomes due again. Absent once retries are exhausted.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Authoritative remote data; only set in `conflict` state.
    pub server_payload: Option<Record>,
    pub resolved_by: Option<Resolution>,
    /// Bumped every time a new local write is folded into this item.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MutationItem {
    /// Create a new pending item.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: Action,
        payload: Record,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            action,
            payload,
            state: ItemState::Pending,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            server_payload: None,
            resolved_by: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a newer local write into this item.
    ///
    /// The payload is shallow-merged with the incoming keys winning.
    pub fn coalesce(&mut self, action: Action, payload: Record, now: DateTime<Utc>) {
        self.action = self.action.coalesce(action);
        self.payload.extend(payload);
        self.revision += 1;
        self.updated_at = now;
    }

    /// Whether this item targets the given entity.
    pub fn targets(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }

    /// An `error` item whose retries are used up.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.state == ItemState::Error && self.attempts >= max_attempts
    }

    /// Whether the item should be pushed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        match self.state {
            ItemState::Pending => true,
            ItemState::Error => {
                self.attempts < max_attempts && self.next_retry_at.map_or(true, |at| at <= now)
            }
            ItemState::Syncing | ItemState::Conflict => false,
        }
    }

    pub fn mark_syncing(&mut self, now: DateTime<Utc>) {
        self.state = ItemState::Syncing;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Record a failed attempt. `next_retry_at` of `None` freezes the item.
    pub fn mark_error(
        &mut self,
        message: impl Into<String>,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.state = ItemState::Error;
        self.attempts += 1;
        self.next_retry_at = next_retry_at;
        self.last_error = Some(message.into());
        self.updated_at = now;
    }

    pub fn mark_conflict(&mut self, server_payload: Record, now: DateTime<Utc>) {
        self.state = ItemState::Conflict;
        self.server_payload = Some(server_payload);
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Put the item back at the start of its lifecycle.
    pub fn reset_pending(&mut self, now: DateTime<Utc>) {
        self.state = ItemState::Pending;
        self.attempts = 0;
        self.next_retry_at = None;
        self.updated_at = now;
    }
}

/// Parse a timestamp field value.
///
/// Accepts RFC 3339 strings and integer milliseconds since the epoch.
/// Anything else is treated as the epoch, so it never wins a comparison.
pub fn parse_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    let parsed = match value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    };
    parsed.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Extract a record's identifier, accepting string or integer ids.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get(ID_FIELD)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_entity_type_round_trip_names() {
        for entity in EntityType::ALL {
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
        }
        assert!("parcela".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_update_then_delete_becomes_delete() {
        let now = Utc::now();
        let mut item = MutationItem::new(
            EntityType::Zona,
            "z1",
            Action::Update,
            payload(json!({"nombre": "Norte"})),
            now,
        );
        item.coalesce(Action::Delete, Record::new(), now);
        assert_eq!(item.action, Action::Delete);
        assert_eq!(item.revision, 1);
    }

    #[test]
    fn test_create_then_update_stays_create_with_merged_payload() {
        let now = Utc::now();
        let mut item = MutationItem::new(
            EntityType::Cultivo,
            "c1",
            Action::Create,
            payload(json!({"nombre": "Maiz", "hectareas": 2})),
            now,
        );
        item.coalesce(Action::Update, payload(json!({"hectareas": 3, "activo": true})), now);

        assert_eq!(item.action, Action::Create);
        assert_eq!(item.payload.get("nombre"), Some(&json!("Maiz")));
        assert_eq!(item.payload.get("hectareas"), Some(&json!(3)));
        assert_eq!(item.payload.get("activo"), Some(&json!(true)));
    }

    #[test]
    fn test_due_rules() {
        let now = Utc::now();
        let mut item =
            MutationItem::new(EntityType::Zona, "z1", Action::Update, Record::new(), now);
        assert!(item.is_due(now, 3));

        item.mark_syncing(now);
        assert!(!item.is_due(now, 3));

        let later = now + chrono::Duration::seconds(30);
        item.mark_error("offline", Some(later), now);
        assert!(!item.is_due(now, 3));
        assert!(item.is_due(later, 3));

        item.attempts = 3;
        item.next_retry_at = None;
        assert!(item.is_exhausted(3));
        assert!(!item.is_due(later, 3));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp(Some(&json!("2024-03-01T10:00:00Z")));
        assert_eq!(rfc.timestamp(), 1_709_287_200);

        let millis = parse_timestamp(Some(&json!(1_709_287_200_000i64)));
        assert_eq!(millis, rfc);

        assert_eq!(parse_timestamp(Some(&json!("yesterday"))), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(parse_timestamp(None), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&payload(json!({"id": "z1"}))), Some("z1".to_string()));
        assert_eq!(record_id(&payload(json!({"id": 7}))), Some("7".to_string()));
        assert_eq!(record_id(&payload(json!({"id": ""}))), None);
        assert_eq!(record_id(&payload(json!({"nombre": "x"}))), None);
    }

    fn action_strategy() -> impl Strategy<Value = Action> {
        prop_oneof![Just(Action::Create), Just(Action::Update), Just(Action::Delete)]
    }

    proptest! {
        #[test]
        fn prop_delete_anywhere_wins(actions in proptest::collection::vec(action_strategy(), 1..12)) {
            let folded = actions[1..]
                .iter()
                .fold(actions[0], |acc, next| acc.coalesce(*next));

            let last_delete = actions.iter().rposition(|a| *a == Action::Delete);
            match last_delete {
                Some(pos) if pos == actions.len() - 1 => prop_assert_eq!(folded, Action::Delete),
                _ => {}
            }
            if actions[0] == Action::Create && !actions.contains(&Action::Delete) {
                prop_assert_eq!(folded, Action::Create);
            }
        }
    }
}
