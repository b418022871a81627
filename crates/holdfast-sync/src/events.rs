//! # Sync Events
//!
//! Outcome notifications from the Sync Queue. The engine uses them to keep the
//! memory tier honest; applications use them to surface dropped or discarded
//! writes.

use chrono::{DateTime, Utc};
use holdfast_core::SyncOperation;

use crate::error::SyncError;

/// Summary of one drain of an owner's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations confirmed by the remote (including idempotent outcomes).
    pub flushed: usize,
    /// Updates discarded because the remote row was newer.
    pub discarded: usize,
    /// Operations removed after exhausting their retries.
    pub dropped: usize,
    /// Operations that failed and stay queued.
    pub retried: usize,
    /// Operations the remote accepted but that could not be removed from the
    /// log. They stay queued and are sent again next drain.
    pub unsettled: usize,
    /// Queue size after the drain.
    pub remaining: usize,
}

/// Receives queue outcome events.
pub trait SyncEventEmitter: Send + Sync {
    /// The remote confirmed an operation (or it was already applied).
    fn emit_applied(&self, owner: &str, op: &SyncOperation);

    /// An update lost to a newer remote row and was discarded.
    fn emit_discarded(&self, owner: &str, op: &SyncOperation, remote_modified: DateTime<Utc>);

    /// An operation exhausted its retries and was removed.
    fn emit_dropped(&self, owner: &str, op: &SyncOperation, error: &SyncError);

    /// A drain finished.
    fn emit_drained(&self, owner: &str, report: &DrainReport);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_applied(&self, _owner: &str, _op: &SyncOperation) {}
    fn emit_discarded(&self, _owner: &str, _op: &SyncOperation, _remote_modified: DateTime<Utc>) {}
    fn emit_dropped(&self, _owner: &str, _op: &SyncOperation, _error: &SyncError) {}
    fn emit_drained(&self, _owner: &str, _report: &DrainReport) {}
}
