//! # Remote Data Service
//!
//! The seam between the engine and the hosted row store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         RemoteStore contract                            │
//! │                                                                         │
//! │  insert(kind, id, payload, conflict_key)                                │
//! │      Ok | DuplicateKey (already applied) | Failure                      │
//! │  update(kind, id, payload)            Ok | NotFound | Failure           │
//! │  delete(kind, id)                     Ok | NotFound (already gone)      │
//! │  last_modified(kind, id)              Some(ts) | None                   │
//! │  select(SelectQuery)                  rows                              │
//! │                                                                         │
//! │  Every call made by the engine is wrapped by the Timeout Guard.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`InMemoryRemote`] is a complete in-process implementation with scripted
//! failures and a call log. Tests and local development run against it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use holdfast_core::{Clock, Payload, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};

// =============================================================================
// Select Query
// =============================================================================

/// Equality filter on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

/// Sort order for a select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub ascending: bool,
}

/// A read against one remote collection.
///
/// ## Example
/// ```rust
/// use holdfast_sync::SelectQuery;
///
/// let query = SelectQuery::new("nutrition_logs")
///     .eq("user_id", "user-1")
///     .eq("date", "2024-03-09")
///     .order_by("logged_at", false)
///     .limit(50);
///
/// assert_eq!(query.filters.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub entity_kind: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SelectQuery {
    /// Selects every row of `entity_kind`.
    pub fn new(entity_kind: impl Into<String>) -> Self {
        SelectQuery {
            entity_kind: entity_kind.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Adds an equality filter.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Sets the sort order.
    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            ascending,
        });
        self
    }

    /// Caps the number of rows returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Label used in timeout errors and logs.
    pub fn label(&self) -> String {
        format!("select {}", self.entity_kind)
    }

    fn matches(&self, payload: &Payload) -> bool {
        self.filters
            .iter()
            .all(|f| payload.get(&f.field) == Some(&f.value))
    }
}

// =============================================================================
// Remote Store Trait
// =============================================================================

/// The remote data service the engine replays writes against and reads from.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts a row. With a `conflict_key`, an existing row that has the same
    /// value in that field is replaced instead of rejected.
    async fn insert(
        &self,
        entity_kind: &str,
        record_id: &str,
        payload: &Payload,
        conflict_key: Option<&str>,
    ) -> RemoteResult<()>;

    /// Updates a row by id.
    async fn update(&self, entity_kind: &str, record_id: &str, payload: &Payload)
        -> RemoteResult<()>;

    /// Deletes a row by id.
    async fn delete(&self, entity_kind: &str, record_id: &str) -> RemoteResult<()>;

    /// Returns the row's last-modified time, `None` if the row is absent.
    async fn last_modified(
        &self,
        entity_kind: &str,
        record_id: &str,
    ) -> RemoteResult<Option<DateTime<Utc>>>;

    /// Runs a read.
    async fn select(&self, query: &SelectQuery) -> RemoteResult<Vec<Value>>;
}

// =============================================================================
// In-Memory Remote
// =============================================================================

/// Which remote method a call used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteMethod {
    Insert,
    Update,
    Delete,
    LastModified,
    Select,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub method: RemoteMethod,
    pub entity_kind: String,
    /// Empty for selects.
    pub record_id: String,
}

#[derive(Debug, Clone)]
struct StoredRow {
    payload: Payload,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RemoteState {
    rows: BTreeMap<(String, String), StoredRow>,
    calls: Vec<RemoteCall>,
    scripted: VecDeque<RemoteError>,
    offline: bool,
    latency: Duration,
}

/// A row store held in process memory.
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryRemote {
    /// Creates an empty remote that stamps modifications with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InMemoryRemote {
            state: Mutex::new(RemoteState::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// While offline every call fails with `RemoteError::Failure`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Queues an error for the next call, whichever method it is.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().scripted.push_back(error);
    }

    /// Delays every call by `latency` before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Places a row directly, as if another device had written it.
    pub fn seed(
        &self,
        entity_kind: &str,
        record_id: &str,
        payload: Payload,
        modified_at: DateTime<Utc>,
    ) {
        self.lock().rows.insert(
            (entity_kind.to_string(), record_id.to_string()),
            StoredRow {
                payload,
                modified_at,
            },
        );
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Current payload of a row.
    pub fn row(&self, entity_kind: &str, record_id: &str) -> Option<Payload> {
        self.lock()
            .rows
            .get(&(entity_kind.to_string(), record_id.to_string()))
            .map(|row| row.payload.clone())
    }

    /// Number of rows of a kind.
    pub fn row_count(&self, entity_kind: &str) -> usize {
        self.lock()
            .rows
            .keys()
            .filter(|(kind, _)| kind == entity_kind)
            .count()
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Number of calls of one method.
    pub fn call_count(&self, method: RemoteMethod) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Records the call, waits out the latency, then applies scripted failures.
    async fn begin(&self, method: RemoteMethod, entity_kind: &str, record_id: &str) -> RemoteResult<()> {
        let latency = {
            let mut state = self.lock();
            state.calls.push(RemoteCall {
                method,
                entity_kind: entity_kind.to_string(),
                record_id: record_id.to_string(),
            });
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if state.offline {
            return Err(RemoteError::failure("remote unreachable"));
        }
        match state.scripted.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn insert(
        &self,
        entity_kind: &str,
        record_id: &str,
        payload: &Payload,
        conflict_key: Option<&str>,
    ) -> RemoteResult<()> {
        self.begin(RemoteMethod::Insert, entity_kind, record_id).await?;

        let now = self.clock.now();
        let mut state = self.lock();
        let key = (entity_kind.to_string(), record_id.to_string());

        if let Some(field) = conflict_key {
            let target = payload.get(field);
            let existing = state
                .rows
                .iter()
                .find(|((kind, _), row)| {
                    kind == entity_kind && target.is_some() && row.payload.get(field) == target
                })
                .map(|(k, _)| k.clone());

            if let Some(existing) = existing {
                debug!(entity_kind, record_id, conflict_key = field, "Upsert replaced row");
                state.rows.remove(&existing);
                state.rows.insert(
                    key,
                    StoredRow {
                        payload: payload.clone(),
                        modified_at: now,
                    },
                );
                return Ok(());
            }
        }

        if state.rows.contains_key(&key) {
            return Err(RemoteError::DuplicateKey {
                entity_kind: entity_kind.to_string(),
                record_id: record_id.to_string(),
            });
        }

        state.rows.insert(
            key,
            StoredRow {
                payload: payload.clone(),
                modified_at: now,
            },
        );
        Ok(())
    }

    async fn update(
        &self,
        entity_kind: &str,
        record_id: &str,
        payload: &Payload,
    ) -> RemoteResult<()> {
        self.begin(RemoteMethod::Update, entity_kind, record_id).await?;

        let now = self.clock.now();
        let mut state = self.lock();
        match state
            .rows
            .get_mut(&(entity_kind.to_string(), record_id.to_string()))
        {
            Some(row) => {
                for (field, value) in payload {
                    row.payload.insert(field.clone(), value.clone());
                }
                row.modified_at = now;
                Ok(())
            }
            None => Err(RemoteError::NotFound {
                entity_kind: entity_kind.to_string(),
                record_id: record_id.to_string(),
            }),
        }
    }

    async fn delete(&self, entity_kind: &str, record_id: &str) -> RemoteResult<()> {
        self.begin(RemoteMethod::Delete, entity_kind, record_id).await?;

        let mut state = self.lock();
        match state
            .rows
            .remove(&(entity_kind.to_string(), record_id.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound {
                entity_kind: entity_kind.to_string(),
                record_id: record_id.to_string(),
            }),
        }
    }

    async fn last_modified(
        &self,
        entity_kind: &str,
        record_id: &str,
    ) -> RemoteResult<Option<DateTime<Utc>>> {
        self.begin(RemoteMethod::LastModified, entity_kind, record_id)
            .await?;

        Ok(self
            .lock()
            .rows
            .get(&(entity_kind.to_string(), record_id.to_string()))
            .map(|row| row.modified_at))
    }

    async fn select(&self, query: &SelectQuery) -> RemoteResult<Vec<Value>> {
        self.begin(RemoteMethod::Select, &query.entity_kind, "").await?;

        let state = self.lock();
        let mut rows: Vec<&Payload> = state
            .rows
            .iter()
            .filter(|((kind, _), row)| *kind == query.entity_kind && query.matches(&row.payload))
            .map(|(_, row)| &row.payload)
            .collect();

        if let Some(ref order) = query.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.field), b.get(&order.field));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|p| Value::Object(p.clone()))
            .collect())
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_duplicate_and_upsert() {
        let remote = InMemoryRemote::default();
        let row = payload(json!({ "id": "p-1", "user_id": "u1", "name": "A" }));

        remote.insert("profiles", "p-1", &row, None).await.unwrap();
        let err = remote.insert("profiles", "p-1", &row, None).await.unwrap_err();
        assert!(err.is_duplicate());

        // Same conflict-key value under a new id replaces the row
        let replacement = payload(json!({ "id": "p-2", "user_id": "u1", "name": "B" }));
        remote
            .insert("profiles", "p-2", &replacement, Some("user_id"))
            .await
            .unwrap();
        assert_eq!(remote.row_count("profiles"), 1);
        assert_eq!(remote.row("profiles", "p-2").unwrap()["name"], json!("B"));
    }

    #[tokio::test]
    async fn test_update_delete_not_found() {
        let remote = InMemoryRemote::default();
        let patch = payload(json!({ "calories": 300 }));

        assert!(remote.update("meals", "m-1", &patch).await.unwrap_err().is_not_found());
        assert!(remote.delete("meals", "m-1").await.unwrap_err().is_not_found());
        assert_eq!(remote.last_modified("meals", "m-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scripted_failures_and_call_log() {
        let remote = InMemoryRemote::default();
        remote.fail_next(RemoteError::failure("503"));

        let row = payload(json!({ "id": "m-1" }));
        assert!(remote.insert("meals", "m-1", &row, None).await.is_err());
        remote.insert("meals", "m-1", &row, None).await.unwrap();

        remote.set_offline(true);
        assert!(remote.delete("meals", "m-1").await.is_err());
        remote.set_offline(false);

        assert_eq!(remote.call_count(RemoteMethod::Insert), 2);
        assert_eq!(remote.calls().last().unwrap().method, RemoteMethod::Delete);
        assert!(remote.row("meals", "m-1").is_some());
    }

    #[tokio::test]
    async fn test_select_filters_orders_limits() {
        let remote = InMemoryRemote::default();
        let now = Utc::now();
        for (id, owner, cals) in [("a", "u1", 300), ("b", "u1", 100), ("c", "u2", 200), ("d", "u1", 200)] {
            remote.seed(
                "meals",
                id,
                payload(json!({ "id": id, "user_id": owner, "calories": cals })),
                now,
            );
        }

        let rows = remote
            .select(
                &SelectQuery::new("meals")
                    .eq("user_id", "u1")
                    .order_by("calories", false)
                    .limit(2),
            )
            .await
            .unwrap();

        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("d")]);
    }
}
