//! # Sync Operations
//!
//! One durable intent to mutate a remote row.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     SyncOperation Lifecycle                             │
//! │                                                                         │
//! │  typed record ──► SyncOperationDraft ──► enqueue ──► SyncOperation      │
//! │                   (validated here)        (id, retry_count = 0,         │
//! │                                            timestamp stamped)           │
//! │                                                  │                      │
//! │                                                  ▼                      │
//! │                                           drain attempts                │
//! │                                                  │                      │
//! │       ┌──────────────┬───────────────┬───────────┴──────┬────────────┐  │
//! │       ▼              ▼               ▼                  ▼            ▼  │
//! │    applied      duplicate key    not found on       remote newer   5th  │
//! │                 (insert)         delete             (update)      fail  │
//! │       │              │               │                  │            │  │
//! │       └──────────────┴───────┬───────┴──────────────────┴────────────┘  │
//! │                              ▼                                          │
//! │                    removed from the queue exactly once                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::validation::{validate_entity_kind, validate_record_id, ValidationResult};

/// Schema-less field map carried by an operation.
///
/// Call sites build it from a typed record via
/// [`SyncOperationDraft::from_record`], never by hand.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Sync Action
// =============================================================================

/// The kind of mutation an operation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Create a new row (client-assigned record id).
    Insert,
    /// Update an existing row by id.
    Update,
    /// Delete a row by id.
    Delete,
}

impl SyncAction {
    /// Returns true if this action must carry a non-empty payload.
    pub fn requires_payload(&self) -> bool {
        matches!(self, SyncAction::Insert | SyncAction::Update)
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Insert => write!(f, "insert"),
            SyncAction::Update => write!(f, "update"),
            SyncAction::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for SyncAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(SyncAction::Insert),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(ValidationError::InvalidFormat {
                field: "action".to_string(),
                reason: format!("unknown action '{}', expected insert, update, or delete", other),
            }),
        }
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// A queued write, exactly as it is persisted in the owner's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Client-generated unique identifier (UUID v4).
    pub id: String,

    /// Remote collection the row lives in.
    pub entity_kind: String,

    /// Mutation to apply.
    pub action: SyncAction,

    /// Field map sent to the remote. Empty for deletes.
    #[serde(default)]
    pub payload: Payload,

    /// Stable identifier of the affected row.
    pub record_id: String,

    /// Logical write time. Drains apply operations in ascending order of
    /// this field, and update conflicts compare it with the remote row.
    pub timestamp: DateTime<Utc>,

    /// Failed remote applications so far.
    #[serde(default)]
    pub retry_count: u32,

    /// Alternate unique key the remote uses for upsert semantics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_key: Option<String>,
}

impl SyncOperation {
    /// Materializes a draft with a system-assigned id and timestamp.
    pub fn from_draft(draft: SyncOperationDraft, id: String, timestamp: DateTime<Utc>) -> Self {
        SyncOperation {
            id,
            entity_kind: draft.entity_kind,
            action: draft.action,
            payload: draft.payload,
            record_id: draft.record_id,
            timestamp,
            retry_count: 0,
            conflict_key: draft.conflict_key,
        }
    }

    /// Returns true once the retry counter has reached the drop threshold.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

// =============================================================================
// Draft
// =============================================================================

/// An operation before it has been enqueued.
///
/// ## Example
/// ```rust
/// use holdfast_core::{SyncAction, SyncOperationDraft};
/// use serde_json::json;
///
/// let draft = SyncOperationDraft::from_record(
///     SyncAction::Update,
///     "profiles",
///     "user-1",
///     &json!({ "display_name": "Sam" }),
/// )
/// .unwrap()
/// .with_conflict_key("user_id");
///
/// assert_eq!(draft.conflict_key.as_deref(), Some("user_id"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperationDraft {
    /// Remote collection the row lives in.
    pub entity_kind: String,
    /// Mutation to apply.
    pub action: SyncAction,
    /// Field map sent to the remote.
    pub payload: Payload,
    /// Stable identifier of the affected row.
    pub record_id: String,
    /// Explicit logical write time. Stamped at enqueue when absent.
    pub timestamp: Option<DateTime<Utc>>,
    /// Alternate unique key for upsert semantics.
    pub conflict_key: Option<String>,
}

impl SyncOperationDraft {
    /// Creates a draft from an already-built payload map.
    pub fn new(
        action: SyncAction,
        entity_kind: impl Into<String>,
        record_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        SyncOperationDraft {
            entity_kind: entity_kind.into(),
            action,
            payload,
            record_id: record_id.into(),
            timestamp: None,
            conflict_key: None,
        }
    }

    /// Creates a delete draft (no payload).
    pub fn delete(entity_kind: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::new(SyncAction::Delete, entity_kind, record_id, Payload::new())
    }

    /// Creates a draft from a typed record.
    ///
    /// The record must serialize to a JSON object; its fields become the
    /// payload. The draft is validated before it is returned.
    pub fn from_record<T: Serialize>(
        action: SyncAction,
        entity_kind: impl Into<String>,
        record_id: impl Into<String>,
        record: &T,
    ) -> CoreResult<Self> {
        let entity_kind = entity_kind.into();
        let payload = match serde_json::to_value(record)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(CoreError::PayloadNotObject {
                    entity_kind,
                    found: json_type_name(&other).to_string(),
                })
            }
        };

        let draft = Self::new(action, entity_kind, record_id, payload);
        draft.validate()?;
        Ok(draft)
    }

    /// Sets an explicit logical write time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the upsert conflict key.
    pub fn with_conflict_key(mut self, key: impl Into<String>) -> Self {
        self.conflict_key = Some(key.into());
        self
    }

    /// Checks the envelope: kind, record id, and payload presence.
    pub fn validate(&self) -> ValidationResult<()> {
        validate_entity_kind(&self.entity_kind)?;
        validate_record_id(&self.record_id)?;

        if self.action.requires_payload() && self.payload.is_empty() {
            return Err(ValidationError::EmptyPayload {
                action: self.action.to_string(),
                entity_kind: self.entity_kind.clone(),
            });
        }

        if let Some(ref key) = self.conflict_key {
            if key.trim().is_empty() {
                return Err(ValidationError::required("conflict_key"));
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct WeightEntry {
        id: &'static str,
        kilograms: f64,
    }

    #[test]
    fn test_action_parsing_and_display() {
        assert_eq!("insert".parse::<SyncAction>().unwrap(), SyncAction::Insert);
        assert_eq!("UPDATE".parse::<SyncAction>().unwrap(), SyncAction::Update);
        assert!("upsert".parse::<SyncAction>().is_err());
        assert_eq!(SyncAction::Delete.to_string(), "delete");
    }

    #[test]
    fn test_from_record_builds_payload() {
        let entry = WeightEntry {
            id: "w-1",
            kilograms: 71.5,
        };
        let draft =
            SyncOperationDraft::from_record(SyncAction::Insert, "weight_logs", "w-1", &entry)
                .unwrap();

        assert_eq!(draft.payload.get("kilograms"), Some(&json!(71.5)));
        assert!(draft.timestamp.is_none());
    }

    #[test]
    fn test_from_record_rejects_non_objects() {
        let err = SyncOperationDraft::from_record(SyncAction::Insert, "meals", "m-1", &42)
            .unwrap_err();
        assert!(matches!(err, CoreError::PayloadNotObject { .. }));
    }

    #[test]
    fn test_update_requires_payload() {
        let draft = SyncOperationDraft::new(SyncAction::Update, "meals", "m-1", Payload::new());
        assert!(matches!(
            draft.validate(),
            Err(ValidationError::EmptyPayload { .. })
        ));

        assert!(SyncOperationDraft::delete("meals", "m-1").validate().is_ok());
    }

    #[test]
    fn test_operation_serde_shape() {
        let draft = SyncOperationDraft::delete("hydration_logs", "h-9");
        let op = SyncOperation::from_draft(draft, "op-1".into(), Utc::now());

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["action"], json!("delete"));
        assert_eq!(value["retry_count"], json!(0));
        assert!(value.get("conflict_key").is_none());

        let back: SyncOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_exhaustion_threshold() {
        let mut op = SyncOperation::from_draft(
            SyncOperationDraft::delete("meals", "m-1"),
            "op".into(),
            Utc::now(),
        );
        op.retry_count = 4;
        assert!(!op.is_exhausted(5));
        op.retry_count = 5;
        assert!(op.is_exhausted(5));
    }
}
