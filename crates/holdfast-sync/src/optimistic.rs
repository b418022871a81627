//! # Optimistic Update Coordinator
//!
//! Runs the remote half of an update whose local half the caller has already
//! shown, then tells the caller whether to keep it or roll it back.
//!
//! ```text
//! caller applies `optimistic` ──► execute(update)
//!                                   │
//!                                   ├─ mark pending
//!                                   ├─ await operation
//!                                   ├─ unmark pending
//!                                   └─ Ok  ──► on_success(optimistic)
//!                                      Err ──► on_error(err, rollback)
//! ```
//!
//! Exactly one callback fires. `cancel_update` forgets the bookkeeping only;
//! the operation still runs to completion and its callback still fires.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

type SuccessCallback<T> = Box<dyn FnOnce(T) + Send>;
type ErrorCallback<T> = Box<dyn FnOnce(SyncError, T) + Send>;

/// Placeholder operation for an update that has not been given one yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOperation;

/// A tentative change plus the data needed to undo it.
pub struct OptimisticUpdate<T, F = NoOperation> {
    id: String,
    optimistic: T,
    rollback: T,
    operation: F,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback<T>>,
}

impl<T> OptimisticUpdate<T, NoOperation> {
    /// Creates an update under `id`. The caller has already applied
    /// `optimistic`; `rollback` restores the prior state.
    pub fn new(id: impl Into<String>, optimistic: T, rollback: T) -> Self {
        OptimisticUpdate {
            id: id.into(),
            optimistic,
            rollback,
            operation: NoOperation,
            on_success: None,
            on_error: None,
        }
    }

    /// Attaches the remote operation that confirms the change.
    pub fn with_operation<F>(self, operation: F) -> OptimisticUpdate<T, F> {
        OptimisticUpdate {
            id: self.id,
            optimistic: self.optimistic,
            rollback: self.rollback,
            operation,
            on_success: self.on_success,
            on_error: self.on_error,
        }
    }
}

impl<T, F> OptimisticUpdate<T, F> {
    /// Called with the optimistic value once the operation succeeds.
    pub fn on_success(mut self, callback: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Called with the error and the rollback value if the operation fails.
    pub fn on_error(mut self, callback: impl FnOnce(SyncError, T) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Key the coordinator tracks this update under.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Snapshot of an update still awaiting its operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub id: String,
    pub started_at: Instant,
}

impl PendingUpdate {
    /// Time since the operation started.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }
}

#[derive(Debug)]
struct PendingEntry {
    generation: u64,
    started_at: Instant,
}

/// Tracks optimistic updates in flight.
#[derive(Debug, Default)]
pub struct OptimisticCoordinator {
    pending: Mutex<HashMap<String, PendingEntry>>,
    next_generation: AtomicU64,
}

impl OptimisticCoordinator {
    /// Creates a coordinator with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs the update's operation and fires exactly one callback.
    ///
    /// Returns `true` if the operation succeeded.
    pub async fn execute<T, F, R>(&self, update: OptimisticUpdate<T, F>) -> bool
    where
        F: Future<Output = SyncResult<R>>,
    {
        let OptimisticUpdate {
            id,
            optimistic,
            rollback,
            operation,
            on_success,
            on_error,
        } = update;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .lock()
            .insert(
                id.clone(),
                PendingEntry {
                    generation,
                    started_at: Instant::now(),
                },
            )
            .is_some();
        if replaced {
            debug!(update_id = %id, "Optimistic update superseded a pending one");
        }

        let outcome = operation.await;

        // A newer update under the same id keeps its own entry
        {
            let mut pending = self.lock();
            if pending.get(&id).map(|e| e.generation) == Some(generation) {
                pending.remove(&id);
            }
        }

        match outcome {
            Ok(_) => {
                debug!(update_id = %id, "Optimistic update confirmed");
                if let Some(callback) = on_success {
                    callback(optimistic);
                }
                true
            }
            Err(e) => {
                warn!(update_id = %id, error = %e, "Optimistic update failed, rolling back");
                if let Some(callback) = on_error {
                    callback(e, rollback);
                }
                false
            }
        }
    }

    /// True while an update under `id` awaits its operation.
    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Snapshot of the pending update under `id`.
    pub fn pending_update(&self, id: &str) -> Option<PendingUpdate> {
        self.lock().get(id).map(|entry| PendingUpdate {
            id: id.to_string(),
            started_at: entry.started_at,
        })
    }

    /// Forgets a pending update. Does not stop its operation.
    pub fn cancel_update(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Number of updates in flight.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
