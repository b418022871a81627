//! # Background Task Runner
//!
//! Priority-ordered executor for deferred work with bounded concurrency and
//! exponential-backoff retries.
//!
//! ## Pass Structure
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           drain loop                                    │
//! │                                                                         │
//! │  ready = pending tasks whose backoff has elapsed                       │
//! │  batch = top max_concurrent of ready by priority (desc), then age      │
//! │                                                                         │
//! │  batch empty?                                                           │
//! │    ├─ nothing pending ──► loop exits                                    │
//! │    └─ only backing off ──► sleep until the earliest is ready            │
//! │                                                                         │
//! │  run batch concurrently, wait for all                                   │
//! │    ok   ──► on_success(value)                                           │
//! │    err  ──► retry_count < max_retries ?                                 │
//! │               yes: retry_count += 1, ready after base·2^(retry_count-1)  │
//! │               no:  on_error(err), task gone                             │
//! │                                                                         │
//! │  pending left? pause, next pass                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A task is attempted at most `max_retries + 1` times. The loop is spawned
//! on first demand, so tasks added back-to-back compete on priority in the
//! same pass.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RunnerSettings;
use crate::error::{SyncError, SyncResult};

type Operation<T> = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<T>> + Send + Sync>;

// =============================================================================
// Background Task
// =============================================================================

/// A unit of deferred work.
///
/// ## Example
/// ```rust,ignore
/// let task = BackgroundTask::new("sync:user-1", move || {
///     let queue = queue.clone();
///     async move { Ok(queue.process("user-1").await) }
/// })
/// .priority(5)
/// .on_error(|e| tracing::warn!(%e, "sync task gave up"));
///
/// runner.add_task(task);
/// ```
pub struct BackgroundTask<T = ()> {
    id: String,
    priority: i32,
    max_retries: Option<u32>,
    retry_count: u32,
    operation: Operation<T>,
    on_success: Option<Box<dyn FnOnce(T) + Send>>,
    on_error: Option<Box<dyn FnOnce(SyncError) + Send>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    /// Creates a task. `operation` is called once per attempt.
    pub fn new<F, Fut>(id: impl Into<String>, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        BackgroundTask {
            id: id.into(),
            priority: 0,
            max_retries: None,
            retry_count: 0,
            operation: Arc::new(move || operation().boxed()),
            on_success: None,
            on_error: None,
        }
    }

    /// Higher runs first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Retries after the first failure. Defaults to the runner setting.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Called with the result of the successful attempt.
    pub fn on_success(mut self, f: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Called once with the last error when retries run out.
    pub fn on_error(mut self, f: impl FnOnce(SyncError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Task identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Runner State
// =============================================================================

struct Pending<T> {
    task: BackgroundTask<T>,
    seq: u64,
    ready_at: Instant,
}

struct RunnerState<T> {
    pending: HashMap<String, Pending<T>>,
    in_flight: HashSet<String>,
    cancelled: HashSet<String>,
    next_seq: u64,
}

struct RunnerInner<T> {
    state: Mutex<RunnerState<T>>,
    draining: AtomicBool,
    wake: Notify,
    settings: RunnerSettings,
}

/// Snapshot of the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStatus {
    /// Pending plus running tasks.
    pub queue_size: usize,
    /// True while the drain loop is alive.
    pub is_processing: bool,
    /// Ids of pending and running tasks, sorted.
    pub task_ids: Vec<String>,
}

/// Priority task executor. Cheap to clone; clones share one queue.
pub struct TaskRunner<T = ()> {
    inner: Arc<RunnerInner<T>>,
}

impl<T> Clone for TaskRunner<T> {
    fn clone(&self) -> Self {
        TaskRunner {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> TaskRunner<T> {
    /// Creates an idle runner.
    pub fn new(settings: RunnerSettings) -> Self {
        TaskRunner {
            inner: Arc::new(RunnerInner {
                state: Mutex::new(RunnerState {
                    pending: HashMap::new(),
                    in_flight: HashSet::new(),
                    cancelled: HashSet::new(),
                    next_seq: 0,
                }),
                draining: AtomicBool::new(false),
                wake: Notify::new(),
                settings,
            }),
        }
    }

    /// Queues a task. A pending task with the same id is replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_task(&self, task: BackgroundTask<T>) {
        {
            let mut state = self.inner.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.cancelled.remove(&task.id);

            let id = task.id.clone();
            let replaced = state
                .pending
                .insert(
                    id.clone(),
                    Pending {
                        task,
                        seq,
                        ready_at: Instant::now(),
                    },
                )
                .is_some();

            debug!(task_id = %id, replaced, "Background task queued");
        }

        self.inner.wake.notify_one();
        self.ensure_draining();
    }

    /// Removes a task. A running task finishes its attempt but is not retried.
    pub fn remove_task(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        if state.pending.remove(id).is_some() {
            return true;
        }
        if state.in_flight.contains(id) {
            state.cancelled.insert(id.to_string());
            return true;
        }
        false
    }

    /// Drops every pending task; running tasks are not retried.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.pending.clear();
        let running: Vec<String> = state.in_flight.iter().cloned().collect();
        state.cancelled.extend(running);
    }

    /// Current queue snapshot.
    pub fn status(&self) -> RunnerStatus {
        let state = self.inner.lock();
        let mut task_ids: Vec<String> = state
            .pending
            .keys()
            .chain(state.in_flight.iter())
            .cloned()
            .collect();
        task_ids.sort();
        task_ids.dedup();

        RunnerStatus {
            queue_size: state.pending.len() + state.in_flight.len(),
            is_processing: self.inner.draining.load(Ordering::Acquire),
            task_ids,
        }
    }

    fn ensure_draining(&self) {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.drain_loop().await });
        }
    }
}

impl<T: Send + 'static> RunnerInner<T> {
    fn lock(&self) -> MutexGuard<'_, RunnerState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            let batch = self.take_ready_batch();

            if batch.is_empty() {
                match self.earliest_ready() {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {}
                            _ = self.wake.notified() => {}
                        }
                        continue;
                    }
                    None => {
                        self.draining.store(false, Ordering::Release);
                        let more = !self.lock().pending.is_empty();
                        if more
                            && self
                                .draining
                                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                                .is_ok()
                        {
                            continue;
                        }
                        debug!("Task runner idle");
                        return;
                    }
                }
            }

            debug!(tasks = batch.len(), "Task runner pass");
            let results = join_all(batch.into_iter().map(|task| async move {
                let result = (task.operation)().await;
                (task, result)
            }))
            .await;

            for (task, result) in results {
                self.settle(task, result);
            }

            let more = !self.lock().pending.is_empty();
            if more {
                tokio::time::sleep(self.settings.pass_pause()).await;
            }
        }
    }

    fn take_ready_batch(&self) -> Vec<BackgroundTask<T>> {
        let now = Instant::now();
        let mut state = self.lock();

        let mut ready: Vec<(i32, u64, String)> = state
            .pending
            .iter()
            .filter(|(_, p)| p.ready_at <= now)
            .map(|(id, p)| (p.task.priority, p.seq, id.clone()))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ready.truncate(self.settings.max_concurrent.max(1));

        let mut batch = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            if let Some(p) = state.pending.remove(&id) {
                state.in_flight.insert(id);
                batch.push(p.task);
            }
        }
        batch
    }

    fn earliest_ready(&self) -> Option<Instant> {
        self.lock().pending.values().map(|p| p.ready_at).min()
    }

    fn settle(&self, mut task: BackgroundTask<T>, result: SyncResult<T>) {
        let mut state = self.lock();
        state.in_flight.remove(&task.id);
        let cancelled = state.cancelled.remove(&task.id);

        match result {
            Ok(value) => {
                drop(state);
                debug!(task_id = %task.id, retry_count = task.retry_count, "Background task succeeded");
                if let Some(callback) = task.on_success.take() {
                    callback(value);
                }
            }
            Err(err) if cancelled => {
                debug!(task_id = %task.id, %err, "Cancelled task failed, not retrying");
            }
            Err(err) => {
                let max_retries = task
                    .max_retries
                    .unwrap_or(self.settings.default_max_retries);

                if task.retry_count < max_retries {
                    task.retry_count += 1;
                    let delay = retry_delay(&self.settings, task.retry_count);
                    debug!(
                        task_id = %task.id,
                        retry_count = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "Background task failed, retrying"
                    );

                    if !state.pending.contains_key(&task.id) {
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        state.pending.insert(
                            task.id.clone(),
                            Pending {
                                task,
                                seq,
                                ready_at: Instant::now() + delay,
                            },
                        );
                    }
                } else {
                    drop(state);
                    warn!(
                        task_id = %task.id,
                        retry_count = task.retry_count,
                        %err,
                        "Background task failed permanently"
                    );
                    if let Some(callback) = task.on_error.take() {
                        callback(err);
                    }
                }
            }
        }
    }
}

/// Delay before retry number `retry_count` (1-based): `base * 2^(retry_count - 1)`.
fn retry_delay(settings: &RunnerSettings, retry_count: u32) -> Duration {
    let base = settings.retry_base();
    let mut backoff = ExponentialBackoff {
        current_interval: base,
        initial_interval: base,
        max_interval: settings.max_retry_delay(),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut delay = base;
    for _ in 0..retry_count {
        if let Some(next) = backoff.next_backoff() {
            delay = next;
        }
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::{mpsc, oneshot};

    #[test]
    fn test_retry_delay_doubles() {
        let settings = RunnerSettings::default();
        assert_eq!(retry_delay(&settings, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(&settings, 2), Duration::from_secs(2));
        assert_eq!(retry_delay(&settings, 3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_highest_priorities_run_first() {
        let runner: TaskRunner<i32> = TaskRunner::new(RunnerSettings::default());
        let started = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for priority in [1, 5, 3, 2, 4] {
            let started = started.clone();
            let done_tx = done_tx.clone();
            runner.add_task(
                BackgroundTask::new(format!("task-{priority}"), move || {
                    let started = started.clone();
                    async move {
                        started.lock().unwrap().push(priority);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(priority)
                    }
                })
                .priority(priority)
                .on_success(move |p| {
                    let _ = done_tx.send(p);
                }),
            );
        }

        for _ in 0..5 {
            done_rx.recv().await.unwrap();
        }

        let order = started.lock().unwrap().clone();
        let mut first_pass = order[..3].to_vec();
        first_pass.sort();
        assert_eq!(first_pass, vec![3, 4, 5]);
        assert_eq!(order[3..], [2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_attempted_max_retries_plus_one() {
        let runner: TaskRunner = TaskRunner::new(RunnerSettings::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let (err_tx, err_rx) = oneshot::channel();
        let begin = Instant::now();

        let counter = attempts.clone();
        runner.add_task(
            BackgroundTask::new("always-fails", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::TaskFailed("boom".into()))
                }
            })
            .max_retries(3)
            .on_error(move |e| {
                let _ = err_tx.send(e);
            }),
        );

        let err = err_rx.await.unwrap();
        assert!(matches!(err, SyncError::TaskFailed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        // 1s + 2s + 4s of backoff
        assert!(Instant::now() - begin >= Duration::from_secs(7));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(runner.status().queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_recovers_after_retry() {
        let runner: TaskRunner<u32> = TaskRunner::new(RunnerSettings::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let (ok_tx, ok_rx) = oneshot::channel();

        let counter = attempts.clone();
        runner.add_task(
            BackgroundTask::new("flaky", move || {
                let counter = counter.clone();
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 => Err(SyncError::TaskFailed("first try".into())),
                        n => Ok(n + 1),
                    }
                }
            })
            .on_success(move |n| {
                let _ = ok_tx.send(n);
            }),
        );

        assert_eq!(ok_rx.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_replaces_pending_task() {
        let runner: TaskRunner<u32> = TaskRunner::new(RunnerSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for value in [1u32, 2] {
            let tx = tx.clone();
            runner.add_task(
                BackgroundTask::new("same", move || async move { Ok(value) }).on_success(
                    move |v| {
                        let _ = tx.send(v);
                    },
                ),
            );
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(v) = rx.recv().await {
            seen.push(v);
        }
        assert_eq!(seen, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_clear_pending() {
        let runner: TaskRunner = TaskRunner::new(RunnerSettings::default());
        let ran = Arc::new(AtomicU32::new(0));

        for id in ["a", "b", "c"] {
            let ran = ran.clone();
            runner.add_task(BackgroundTask::new(id, move || {
                let ran = ran.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        assert!(runner.remove_task("b"));
        assert!(!runner.remove_task("missing"));
        assert_eq!(runner.status().task_ids, vec!["a", "c"]);

        runner.clear();
        assert_eq!(runner.status().queue_size, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_while_running() {
        let runner: TaskRunner = TaskRunner::new(RunnerSettings::default());
        let gate = Arc::new(Notify::new());
        let (done_tx, done_rx) = oneshot::channel();

        let waiter = gate.clone();
        runner.add_task(
            BackgroundTask::new("gated", move || {
                let waiter = waiter.clone();
                async move {
                    waiter.notified().await;
                    Ok(())
                }
            })
            .on_success(move |_| {
                let _ = done_tx.send(());
            }),
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        let status = runner.status();
        assert!(status.is_processing);
        assert_eq!(status.task_ids, vec!["gated"]);

        gate.notify_one();
        done_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!runner.status().is_processing);
    }
}
