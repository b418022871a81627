//! # Sync Queue
//!
//! Durable, per-owner log of pending writes, replayed against the remote.
//!
//! ## Drain Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         process(owner)                                  │
//! │                                                                         │
//! │  drain already running for owner? ── yes ──► return 0                   │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  snapshot = log sorted by timestamp (stable)                           │
//! │        │                                                                │
//! │        ▼  for each op, one at a time                                    │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │ insert: remote.insert(..., conflict_key)                          │ │
//! │  │         ok | duplicate key           → remove, flushed += 1       │ │
//! │  │ update: remote.last_modified > op.timestamp                       │ │
//! │  │         yes                          → remove (stale discard)     │ │
//! │  │         no, or check failed          → remote.update              │ │
//! │  │             ok                       → remove, flushed += 1       │ │
//! │  │ delete: ok | not found               → remove, flushed += 1       │ │
//! │  │ anything else                        → retry_count += 1           │ │
//! │  │         retry_count == max_retries   → remove (dropped)           │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! │  Every remote call goes through the Timeout Guard. An op counts as     │
//! │  flushed or discarded only once its removal is persisted.              │
//! │  Each removal or increment re-reads the log under the owner's lock,    │
//! │  so operations enqueued mid-drain survive. The lock is never held      │
//! │  across a remote call.                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use holdfast_core::validation::validate_owner;
use holdfast_core::{Clock, SyncAction, SyncOperation, SyncOperationDraft};
use holdfast_store::{Namespace, Store};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::{SyncError, SyncResult};
use crate::events::{DrainReport, SyncEventEmitter};
use crate::remote::RemoteStore;
use crate::timeout::with_timeout;

/// How one remote application ended.
#[derive(Debug)]
enum Outcome {
    Applied,
    AlreadyApplied,
    Stale(DateTime<Utc>),
    Failed(SyncError),
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureOutcome {
    Retained(u32),
    Dropped(u32),
    Missing,
}

/// Clears the owner's in-flight marker when the drain ends.
struct DrainGuard<'a> {
    draining: &'a Mutex<HashSet<String>>,
    owner: String,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.draining
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.owner);
    }
}

/// The durable write queue.
pub struct SyncQueue {
    store: Store,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn SyncEventEmitter>,
    settings: QueueSettings,

    /// Owners with a drain in flight.
    draining: Mutex<HashSet<String>>,

    /// Serializes read-modify-write cycles on each owner's log.
    log_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    /// Last auto-assigned timestamp.
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl SyncQueue {
    /// Creates a queue over `store`, replaying against `remote`.
    pub fn new(
        store: Store,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        emitter: Arc<dyn SyncEventEmitter>,
        settings: QueueSettings,
    ) -> Self {
        SyncQueue {
            store,
            remote,
            clock,
            emitter,
            settings,
            draining: Mutex::new(HashSet::new()),
            log_locks: Mutex::new(HashMap::new()),
            last_stamp: Mutex::new(None),
        }
    }

    // =========================================================================
    // Log Access
    // =========================================================================

    fn log_lock(&self, owner: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.log_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(owner.to_string()).or_default())
    }

    async fn read_log(&self, owner: &str) -> SyncResult<Vec<SyncOperation>> {
        let key = Namespace::Queue.owner_prefix(owner);
        match self.store.entries().get(&key).await? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| SyncError::CorruptRecord {
                key,
                reason: e.to_string(),
            }),
        }
    }

    async fn write_log(&self, owner: &str, ops: &[SyncOperation]) -> SyncResult<()> {
        let key = Namespace::Queue.owner_prefix(owner);
        let entries = self.store.entries();

        if ops.is_empty() {
            entries.remove(&key).await?;
        } else {
            entries.put(&key, &serde_json::to_string(ops)?).await?;
        }
        Ok(())
    }

    /// Runs `f` on the owner's log under its lock and persists the result.
    async fn modify<R>(
        &self,
        owner: &str,
        f: impl FnOnce(&mut Vec<SyncOperation>) -> R,
    ) -> SyncResult<R> {
        let lock = self.log_lock(owner);
        let _held = lock.lock().await;

        let mut ops = self.read_log(owner).await?;
        let result = f(&mut ops);
        self.write_log(owner, &ops).await?;
        Ok(result)
    }

    fn stamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut last = self.last_stamp.lock().unwrap_or_else(|e| e.into_inner());
        let stamped = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamped);
        stamped
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Durably appends a write for `owner`.
    ///
    /// ## Errors
    /// * `SyncError::Validation` - bad owner or draft
    /// * `SyncError::QuotaExceeded` / `SyncError::Storage` - not persisted
    pub async fn enqueue(&self, owner: &str, draft: SyncOperationDraft) -> SyncResult<SyncOperation> {
        validate_owner(owner)?;
        draft.validate()?;

        let timestamp = match draft.timestamp {
            Some(ts) => ts,
            None => self.stamp(),
        };
        let op = SyncOperation::from_draft(draft, Uuid::new_v4().to_string(), timestamp);

        let stored = op.clone();
        let result = self.modify(owner, move |ops| ops.push(stored)).await;
        if let Err(ref e) = result {
            error!(owner = %owner, op_id = %op.id, ?e, "Failed to persist queued write");
        }
        result?;

        debug!(
            owner = %owner,
            op_id = %op.id,
            entity_kind = %op.entity_kind,
            action = %op.action,
            "Write queued"
        );
        Ok(op)
    }

    /// Pending operations for `owner`, in enqueue order.
    pub async fn peek(&self, owner: &str) -> SyncResult<Vec<SyncOperation>> {
        validate_owner(owner)?;
        self.read_log(owner).await
    }

    /// Number of pending operations for `owner`.
    pub async fn size(&self, owner: &str) -> SyncResult<usize> {
        Ok(self.peek(owner).await?.len())
    }

    /// Removes one operation by id. Returns true if it was pending.
    pub async fn dequeue(&self, owner: &str, op_id: &str) -> SyncResult<bool> {
        validate_owner(owner)?;
        self.modify(owner, |ops| {
            let before = ops.len();
            ops.retain(|op| op.id != op_id);
            ops.len() != before
        })
        .await
    }

    /// Discards every pending operation for `owner`.
    pub async fn clear(&self, owner: &str) -> SyncResult<()> {
        validate_owner(owner)?;
        self.modify(owner, |ops| ops.clear()).await?;
        info!(owner = %owner, "Sync queue cleared");
        Ok(())
    }

    /// True while a drain for `owner` is running.
    pub fn is_processing(&self, owner: &str) -> bool {
        self.draining
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(owner)
    }

    /// Drains `owner`'s queue. Returns the number of writes confirmed.
    ///
    /// Returns 0 without doing anything when a drain for the same owner is
    /// already in flight. Never fails: every error is recorded against the
    /// operation that caused it.
    pub async fn process(&self, owner: &str) -> usize {
        self.drain(owner).await.flushed
    }

    /// [`process`](Self::process) with the full outcome breakdown.
    pub async fn drain(&self, owner: &str) -> DrainReport {
        if let Err(e) = validate_owner(owner) {
            warn!(owner = %owner, %e, "Refusing to drain invalid owner");
            return DrainReport::default();
        }

        let Some(_guard) = self.begin_drain(owner) else {
            debug!(owner = %owner, "Drain already in progress");
            return DrainReport::default();
        };

        let mut snapshot = match self.read_log(owner).await {
            Ok(ops) => ops,
            Err(e) => {
                error!(owner = %owner, ?e, "Failed to read sync queue");
                return DrainReport::default();
            }
        };

        if snapshot.is_empty() {
            return DrainReport::default();
        }

        snapshot.sort_by_key(|op| op.timestamp);
        let mut report = DrainReport::default();

        for op in &snapshot {
            match self.apply(op).await {
                Outcome::Applied | Outcome::AlreadyApplied => {
                    if self.remove_op(owner, &op.id).await {
                        report.flushed += 1;
                        self.emitter.emit_applied(owner, op);
                    } else {
                        report.unsettled += 1;
                    }
                }
                Outcome::Stale(remote_modified) => {
                    warn!(
                        owner = %owner,
                        op_id = %op.id,
                        entity_kind = %op.entity_kind,
                        record_id = %op.record_id,
                        local = %op.timestamp,
                        remote = %remote_modified,
                        "Discarding stale update, remote row is newer"
                    );
                    if self.remove_op(owner, &op.id).await {
                        report.discarded += 1;
                        self.emitter.emit_discarded(owner, op, remote_modified);
                    } else {
                        report.unsettled += 1;
                    }
                }
                Outcome::Failed(err) => match self.record_failure(owner, &op.id).await {
                    Ok(FailureOutcome::Retained(retry_count)) => {
                        debug!(owner = %owner, op_id = %op.id, retry_count, %err, "Write failed, will retry");
                        report.retried += 1;
                    }
                    Ok(FailureOutcome::Dropped(retry_count)) => {
                        warn!(
                            owner = %owner,
                            op_id = %op.id,
                            entity_kind = %op.entity_kind,
                            retry_count,
                            %err,
                            "Dropping write after exhausting retries"
                        );
                        report.dropped += 1;
                        self.emitter.emit_dropped(owner, op, &err);
                    }
                    Ok(FailureOutcome::Missing) => {}
                    Err(e) => {
                        error!(owner = %owner, op_id = %op.id, ?e, "Failed to record write failure");
                    }
                },
            }
        }

        report.remaining = match self.read_log(owner).await {
            Ok(ops) => ops.len(),
            Err(_) => 0,
        };

        info!(
            owner = %owner,
            flushed = report.flushed,
            discarded = report.discarded,
            dropped = report.dropped,
            retried = report.retried,
            unsettled = report.unsettled,
            remaining = report.remaining,
            "Sync queue drained"
        );
        self.emitter.emit_drained(owner, &report);

        report
    }

    // =========================================================================
    // Drain Internals
    // =========================================================================

    fn begin_drain(&self, owner: &str) -> Option<DrainGuard<'_>> {
        let mut draining = self.draining.lock().unwrap_or_else(|e| e.into_inner());
        if !draining.insert(owner.to_string()) {
            return None;
        }
        Some(DrainGuard {
            draining: &self.draining,
            owner: owner.to_string(),
        })
    }

    async fn apply(&self, op: &SyncOperation) -> Outcome {
        let deadline = self.settings.remote_timeout();
        let label = format!("{} {}", op.action, op.entity_kind);
        let kind = op.entity_kind.as_str();
        let id = op.record_id.as_str();

        match op.action {
            SyncAction::Insert => {
                let call = self
                    .remote
                    .insert(kind, id, &op.payload, op.conflict_key.as_deref());
                match with_timeout(deadline, &label, call).await {
                    Ok(()) => Outcome::Applied,
                    Err(SyncError::Remote(e)) if e.is_duplicate() => {
                        debug!(op_id = %op.id, "Insert already applied");
                        Outcome::AlreadyApplied
                    }
                    Err(e) => Outcome::Failed(e),
                }
            }
            SyncAction::Update => {
                let check = self.remote.last_modified(kind, id);
                match with_timeout(deadline, &format!("last_modified {}", kind), check).await {
                    Ok(Some(remote_ts)) if remote_ts > op.timestamp => {
                        return Outcome::Stale(remote_ts)
                    }
                    Ok(_) => {}
                    Err(SyncError::Remote(e)) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(op_id = %op.id, %e, "Staleness check failed, sending update anyway");
                    }
                }

                let call = self.remote.update(kind, id, &op.payload);
                match with_timeout(deadline, &label, call).await {
                    Ok(()) => Outcome::Applied,
                    Err(e) => Outcome::Failed(e),
                }
            }
            SyncAction::Delete => {
                let call = self.remote.delete(kind, id);
                match with_timeout(deadline, &label, call).await {
                    Ok(()) => Outcome::Applied,
                    Err(SyncError::Remote(e)) if e.is_not_found() => {
                        debug!(op_id = %op.id, "Delete already applied");
                        Outcome::AlreadyApplied
                    }
                    Err(e) => Outcome::Failed(e),
                }
            }
        }
    }

    /// Returns `false` if the removal could not be persisted.
    async fn remove_op(&self, owner: &str, op_id: &str) -> bool {
        let result = self
            .modify(owner, |ops| ops.retain(|op| op.id != op_id))
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(owner = %owner, op_id = %op_id, ?e, "Failed to remove applied write, it stays queued");
                false
            }
        }
    }

    async fn record_failure(&self, owner: &str, op_id: &str) -> SyncResult<FailureOutcome> {
        let max_retries = self.settings.max_retries;
        self.modify(owner, |ops| {
            let Some(pos) = ops.iter().position(|op| op.id == op_id) else {
                return FailureOutcome::Missing;
            };

            ops[pos].retry_count += 1;
            let retry_count = ops[pos].retry_count;
            if ops[pos].is_exhausted(max_retries) {
                ops.remove(pos);
                FailureOutcome::Dropped(retry_count)
            } else {
                FailureOutcome::Retained(retry_count)
            }
        })
        .await
    }
}
