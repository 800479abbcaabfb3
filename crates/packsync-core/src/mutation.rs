// ABOUTME: Defines outbox mutations as a tagged union and the loose action request they are built from.
// ABOUTME: Operation-specific required fields are checked here, at the point an action is enqueued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::backend::{Backend, BackendError};

/// The four operations the backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Upsert => "upsert",
        };
        f.write_str(name)
    }
}

/// Errors raised when an action request is missing the fields its operation needs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("table name must not be empty")]
    EmptyTable,

    #[error("{0} requires a payload")]
    MissingPayload(OpKind),

    #[error("{0} payload must be a JSON object or array")]
    InvalidPayload(OpKind),

    #[error("{0} requires match criteria or a payload to match on")]
    MissingFilter(OpKind),

    #[error("match criteria must be a non-empty object of scalar values: {0}")]
    InvalidFilter(String),
}

/// A mutation as callers describe it: the operation plus whichever of
/// `payload` and `match` they have. Validated into a [`Mutation`] on enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub table: String,
    pub op: OpKind,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default, rename = "match")]
    pub filter: Option<Value>,
    #[serde(default)]
    pub on_conflict: Option<String>,
}

impl ActionRequest {
    fn new(table: impl Into<String>, op: OpKind) -> Self {
        Self {
            id: None,
            table: table.into(),
            op,
            payload: None,
            filter: None,
            on_conflict: None,
        }
    }

    pub fn insert(table: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(table, OpKind::Insert)
        }
    }

    pub fn update(table: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(table, OpKind::Update)
        }
    }

    pub fn delete(table: impl Into<String>, filter: Value) -> Self {
        Self {
            filter: Some(filter),
            ..Self::new(table, OpKind::Delete)
        }
    }

    pub fn upsert(table: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(table, OpKind::Upsert)
        }
    }

    /// Use a caller-chosen id, which doubles as the idempotency key.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_match(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_on_conflict(mut self, column: impl Into<String>) -> Self {
        self.on_conflict = Some(column.into());
        self
    }

    /// Check the request and build the mutation it describes.
    ///
    /// `update` and `delete` fall back to the payload as match criteria when
    /// no explicit match was given.
    pub fn to_mutation(&self) -> Result<Mutation, MutationError> {
        if self.table.trim().is_empty() {
            return Err(MutationError::EmptyTable);
        }

        match self.op {
            OpKind::Insert => Ok(Mutation::Insert {
                payload: require_payload(self.op, self.payload.as_ref())?,
            }),
            OpKind::Upsert => Ok(Mutation::Upsert {
                payload: require_payload(self.op, self.payload.as_ref())?,
                on_conflict: self.on_conflict.clone(),
            }),
            OpKind::Update => {
                let payload = require_payload(self.op, self.payload.as_ref())?;
                let filter = self.filter.clone().unwrap_or_else(|| payload.clone());
                validate_filter(&filter)?;
                Ok(Mutation::Update { payload, filter })
            }
            OpKind::Delete => {
                let filter = self
                    .filter
                    .clone()
                    .or_else(|| self.payload.clone())
                    .ok_or(MutationError::MissingFilter(self.op))?;
                validate_filter(&filter)?;
                Ok(Mutation::Delete { filter })
            }
        }
    }
}

fn require_payload(op: OpKind, payload: Option<&Value>) -> Result<Value, MutationError> {
    match payload {
        None | Some(Value::Null) => Err(MutationError::MissingPayload(op)),
        Some(value @ (Value::Object(_) | Value::Array(_))) => Ok(value.clone()),
        Some(_) => Err(MutationError::InvalidPayload(op)),
    }
}

fn validate_filter(filter: &Value) -> Result<(), MutationError> {
    let Value::Object(map) = filter else {
        return Err(MutationError::InvalidFilter(filter.to_string()));
    };
    // An empty filter would match every row in the table.
    if map.is_empty() {
        return Err(MutationError::InvalidFilter(filter.to_string()));
    }
    if let Some((column, _)) = map
        .iter()
        .find(|(_, v)| matches!(v, Value::Object(_) | Value::Array(_)))
    {
        return Err(MutationError::InvalidFilter(format!(
            "column {column:?} has a non-scalar value"
        )));
    }
    Ok(())
}

/// A validated mutation with exactly the fields its operation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Insert {
        payload: Value,
    },
    Update {
        payload: Value,
        filter: Value,
    },
    Delete {
        filter: Value,
    },
    Upsert {
        payload: Value,
        on_conflict: Option<String>,
    },
}

impl Mutation {
    pub fn kind(&self) -> OpKind {
        match self {
            Mutation::Insert { .. } => OpKind::Insert,
            Mutation::Update { .. } => OpKind::Update,
            Mutation::Delete { .. } => OpKind::Delete,
            Mutation::Upsert { .. } => OpKind::Upsert,
        }
    }

    /// Deliver this mutation to `table` on the backend.
    pub async fn apply(&self, table: &str, backend: &dyn Backend) -> Result<(), BackendError> {
        match self {
            Mutation::Insert { payload } => backend.insert(table, payload).await,
            Mutation::Update { payload, filter } => backend.update(table, payload, filter).await,
            Mutation::Delete { filter } => backend.delete(table, filter).await,
            Mutation::Upsert {
                payload,
                on_conflict,
            } => backend.upsert(table, payload, on_conflict.as_deref()).await,
        }
    }
}

/// A durably queued mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    pub table: String,
    pub mutation: Mutation,
    pub queued_at: DateTime<Utc>,
    /// Monotonic enqueue counter; breaks ties between equal `queued_at` stamps.
    pub seq: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_tried_at: Option<DateTime<Utc>>,
    /// Set once the item exceeded the retry budget. Dead-lettered items are
    /// kept but no longer delivered.
    #[serde(default)]
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxItem {
    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Ordering key for FIFO delivery.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.queued_at, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_falls_back_to_payload_as_match() {
        let request = ActionRequest::update("bookmarks", json!({"id": "b1", "note": "hi"}));
        let mutation = request.to_mutation().unwrap();
        assert_eq!(
            mutation,
            Mutation::Update {
                payload: json!({"id": "b1", "note": "hi"}),
                filter: json!({"id": "b1", "note": "hi"}),
            }
        );
    }

    #[test]
    fn explicit_match_wins_over_payload() {
        let request = ActionRequest::update("bookmarks", json!({"note": "edited"}))
            .with_match(json!({"id": "b1"}));
        match request.to_mutation().unwrap() {
            Mutation::Update { filter, .. } => assert_eq!(filter, json!({"id": "b1"})),
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[test]
    fn delete_accepts_payload_when_match_is_absent() {
        let mut request = ActionRequest::delete("highlights", json!({"id": 7}));
        request.payload = request.filter.take();
        assert_eq!(
            request.to_mutation().unwrap(),
            Mutation::Delete {
                filter: json!({"id": 7})
            }
        );
    }

    #[test]
    fn delete_without_any_criteria_is_rejected() {
        let mut request = ActionRequest::delete("highlights", json!({"id": 7}));
        request.filter = None;
        assert_eq!(
            request.to_mutation().unwrap_err(),
            MutationError::MissingFilter(OpKind::Delete)
        );
    }

    #[test]
    fn empty_filter_is_rejected() {
        let request = ActionRequest::delete("highlights", json!({}));
        assert!(matches!(
            request.to_mutation(),
            Err(MutationError::InvalidFilter(_))
        ));
    }

    #[test]
    fn nested_payload_needs_explicit_match_for_update() {
        let request = ActionRequest::update("notes", json!({"id": "n1", "tags": ["a"]}));
        assert!(matches!(
            request.to_mutation(),
            Err(MutationError::InvalidFilter(_))
        ));

        let request = request.with_match(json!({"id": "n1"}));
        assert!(request.to_mutation().is_ok());
    }

    #[test]
    fn insert_requires_structured_payload() {
        let mut request = ActionRequest::insert("notes", json!("just a string"));
        assert_eq!(
            request.to_mutation().unwrap_err(),
            MutationError::InvalidPayload(OpKind::Insert)
        );

        request.payload = None;
        assert_eq!(
            request.to_mutation().unwrap_err(),
            MutationError::MissingPayload(OpKind::Insert)
        );
    }

    #[test]
    fn blank_table_is_rejected() {
        let request = ActionRequest::insert("  ", json!({"a": 1}));
        assert_eq!(request.to_mutation().unwrap_err(), MutationError::EmptyTable);
    }

    #[test]
    fn request_deserializes_match_keyword() {
        let request: ActionRequest = serde_json::from_value(json!({
            "table": "bookmarks",
            "op": "delete",
            "match": {"id": "b1"}
        }))
        .unwrap();
        assert_eq!(request.op, OpKind::Delete);
        assert_eq!(request.filter, Some(json!({"id": "b1"})));
        assert!(request.id.is_none());
    }

    #[test]
    fn upsert_keeps_conflict_column() {
        let request =
            ActionRequest::upsert("bookmarks", json!({"id": "b1"})).with_on_conflict("id");
        assert_eq!(
            request.to_mutation().unwrap(),
            Mutation::Upsert {
                payload: json!({"id": "b1"}),
                on_conflict: Some("id".to_string()),
            }
        );
    }
}
