//! # Request Batcher
//!
//! Groups remote reads issued close together in time into one execution round.
//!
//! ## Windowing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  t=0   add(a) ─┐  window opens (fixed, never extended)                  │
//! │  t=20  add(b) ─┤                                                        │
//! │  t=50          └──► batch #1 {a, b} runs concurrently                   │
//! │  t=60  add(c) ─┐  new window                                            │
//! │  t=110         └──► batch #2 {c}                                        │
//! │                                                                         │
//! │  pending reaches max_batch_size ──► runs immediately                    │
//! │  more pending than fits ──► highest priority first, rest wait           │
//! │                                                                         │
//! │  Each caller gets its own result, tagged with the batch_seq of the      │
//! │  round it ran in. One failure never affects its batch-mates.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BatcherSettings;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteStore, SelectQuery};
use crate::timeout::with_timeout;

type BatchRun = Box<dyn FnOnce() -> BoxFuture<'static, SyncResult<Value>> + Send>;

// =============================================================================
// Batch Operation
// =============================================================================

/// One deferred remote read.
pub struct BatchOperation {
    id: String,
    priority: i32,
    run: BatchRun,
}

impl BatchOperation {
    /// Wraps an arbitrary async read.
    pub fn new<F, Fut>(id: impl Into<String>, priority: i32, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<Value>> + Send + 'static,
    {
        BatchOperation {
            id: id.into(),
            priority,
            run: Box::new(move || run().boxed()),
        }
    }

    /// A select against `remote`, bounded by `deadline`. Rows come back as a
    /// JSON array.
    pub fn query(
        remote: Arc<dyn RemoteStore>,
        query: SelectQuery,
        priority: i32,
        deadline: Duration,
    ) -> Self {
        let id = format!("{}:{}", query.entity_kind, Uuid::new_v4());
        Self::new(id, priority, move || async move {
            let rows = with_timeout(deadline, &query.label(), remote.select(&query)).await?;
            Ok(Value::Array(rows))
        })
    }

    /// Operation id, echoed in its result.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Outcome of one batched operation.
#[derive(Debug)]
pub struct BatchResult {
    pub id: String,
    pub batch_seq: u64,
    pub result: SyncResult<Value>,
}

// =============================================================================
// Handle
// =============================================================================

enum BatcherCommand {
    Add {
        op: BatchOperation,
        reply: oneshot::Sender<BatchResult>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle for submitting to a running batcher.
#[derive(Clone)]
pub struct BatcherHandle {
    cmd_tx: mpsc::Sender<BatcherCommand>,
}

impl BatcherHandle {
    /// Submits an operation and waits for its result.
    ///
    /// ## Errors
    /// * `SyncError::ShuttingDown` - the batcher has stopped
    pub async fn add_operation(&self, op: BatchOperation) -> SyncResult<BatchResult> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(BatcherCommand::Add { op, reply })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;

        rx.await
            .map_err(|_| SyncError::ChannelError("Batcher dropped the operation".into()))
    }

    /// Executes everything pending now and waits for it to finish.
    pub async fn flush(&self) -> SyncResult<()> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BatcherCommand::Flush { done })
            .await
            .map_err(|_| SyncError::ChannelError("Batcher channel closed".into()))?;

        rx.await
            .map_err(|_| SyncError::ChannelError("Batcher channel closed".into()))
    }

    /// Flushes, then stops accepting operations.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(BatcherCommand::Shutdown { done })
            .await
            .map_err(|_| SyncError::ChannelError("Batcher channel closed".into()))?;

        rx.await
            .map_err(|_| SyncError::ChannelError("Batcher channel closed".into()))
    }
}

// =============================================================================
// Request Batcher
// =============================================================================

struct Queued {
    op: BatchOperation,
    reply: oneshot::Sender<BatchResult>,
}

/// The batching actor.
pub struct RequestBatcher {
    settings: BatcherSettings,
    pending: Vec<Queued>,
    deadline: Option<Instant>,
    next_seq: u64,
    in_flight: Arc<watch::Sender<BTreeSet<u64>>>,
}

impl RequestBatcher {
    /// Spawns the batcher and returns its handle.
    pub fn start(settings: BatcherSettings) -> BatcherHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (in_flight, _) = watch::channel(BTreeSet::new());

        let batcher = RequestBatcher {
            settings,
            pending: Vec::new(),
            deadline: None,
            next_seq: 1,
            in_flight: Arc::new(in_flight),
        };

        tokio::spawn(async move {
            batcher.run(cmd_rx).await;
        });

        BatcherHandle { cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<BatcherCommand>) {
        info!(
            window_ms = self.settings.window_ms,
            max_batch_size = self.settings.max_batch_size,
            "Request batcher started"
        );

        loop {
            let deadline = self.deadline;

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(BatcherCommand::Add { op, reply }) => self.enqueue(op, reply),
                    Some(BatcherCommand::Flush { done }) => {
                        self.execute_all_pending();
                        self.notify_when_settled(done);
                    }
                    Some(BatcherCommand::Shutdown { done }) => {
                        info!("Request batcher shutting down");
                        self.execute_all_pending();
                        self.notify_when_settled(done);
                        break;
                    }
                    None => {
                        self.execute_all_pending();
                        break;
                    }
                },
                _ = window_elapsed(deadline), if deadline.is_some() => {
                    self.execute_batch();
                }
            }
        }

        info!("Request batcher stopped");
    }

    fn enqueue(&mut self, op: BatchOperation, reply: oneshot::Sender<BatchResult>) {
        if self.pending.is_empty() {
            self.deadline = Some(Instant::now() + self.settings.window());
        }

        debug!(op_id = %op.id, priority = op.priority, "Operation batched");
        self.pending.push(Queued { op, reply });

        if self.pending.len() >= self.settings.max_batch_size {
            self.execute_batch();
        }
    }

    fn execute_all_pending(&mut self) {
        while !self.pending.is_empty() {
            self.execute_batch();
        }
    }

    /// Runs up to `max_batch_size` pending operations, highest priority first.
    fn execute_batch(&mut self) {
        if self.pending.is_empty() {
            self.deadline = None;
            return;
        }

        // Stable: equal priorities keep arrival order
        self.pending.sort_by(|a, b| b.op.priority.cmp(&a.op.priority));
        let take = self.settings.max_batch_size.max(1).min(self.pending.len());
        let batch: Vec<Queued> = self.pending.drain(..take).collect();

        self.deadline = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now() + self.settings.window())
        };

        let batch_seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.send_modify(|seqs| {
            seqs.insert(batch_seq);
        });

        let in_flight = Arc::clone(&self.in_flight);
        debug!(batch_seq, size = batch.len(), "Executing batch");

        tokio::spawn(async move {
            join_all(batch.into_iter().map(|queued| async move {
                let Queued { op, reply } = queued;
                let result = (op.run)().await;
                let _ = reply.send(BatchResult {
                    id: op.id,
                    batch_seq,
                    result,
                });
            }))
            .await;

            in_flight.send_modify(|seqs| {
                seqs.remove(&batch_seq);
            });
        });
    }

    /// Signals `done` once every batch started so far has finished.
    fn notify_when_settled(&self, done: oneshot::Sender<()>) {
        let started_before = self.next_seq;
        let mut rx = self.in_flight.subscribe();

        tokio::spawn(async move {
            let _ = rx
                .wait_for(|seqs| seqs.range(..started_before).next().is_none())
                .await;
            let _ = done.send(());
        });
    }
}

async fn window_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
