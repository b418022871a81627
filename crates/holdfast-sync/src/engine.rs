//! # Offline Engine
//!
//! Owns one instance of every component and wires reads and writes through
//! them.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           OfflineEngine                                 │
//! │                                                                         │
//! │  READ  read(owner, key, query)                                         │
//! │  ─────────────────────────────                                         │
//! │    MemoryCache ── hit ──────────────────────────► CacheSource::Memory  │
//! │        │ miss                                                           │
//! │    DurableCache ─ hit ─► fill memory ───────────► CacheSource::Durable │
//! │        │ miss                                                           │
//! │    RequestBatcher ─► remote.select ─► fill both ► CacheSource::Network │
//! │                                                                         │
//! │  refresh(...) goes to the network first and falls back to the durable  │
//! │  tier (CacheSource::Offline) when the remote is unavailable.           │
//! │                                                                         │
//! │  WRITE  write(owner, draft)                                            │
//! │  ──────────────────────────                                            │
//! │    SyncQueue.enqueue ─► TaskRunner["sync:{owner}"] ─► SyncQueue.drain  │
//! │                                                      │                  │
//! │                          applied / discarded ────────┴─► invalidate     │
//! │                                                   memory kind, mark     │
//! │                                                   durable kind stale    │
//! │                                                                         │
//! │  write_optimistic wraps the enqueue in the OptimisticCoordinator.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use holdfast_core::validation::validate_owner;
use holdfast_core::{CacheKey, Clock, SyncOperation, SyncOperationDraft, SystemClock};
use holdfast_store::{Store, StoreConfig};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::batcher::{BatchOperation, BatcherHandle, RequestBatcher};
use crate::config::EngineConfig;
use crate::durable_cache::DurableCache;
use crate::error::{SyncError, SyncResult};
use crate::events::{DrainReport, NoOpEmitter, SyncEventEmitter};
use crate::memory_cache::{CacheStats, CleanupHandle, MemoryCache, TtlPolicy};
use crate::optimistic::{OptimisticCoordinator, OptimisticUpdate};
use crate::queue::SyncQueue;
use crate::remote::{RemoteStore, SelectQuery};
use crate::runner::{BackgroundTask, RunnerStatus, TaskRunner};

/// Interactive reads outrank everything else in a batch.
const READ_PRIORITY: i32 = 10;
const SYNC_PRIORITY: i32 = 5;
const PRELOAD_PRIORITY: i32 = 1;

// =============================================================================
// Read Results
// =============================================================================

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Live entry in the memory tier.
    Memory,
    /// Entry from the durable tier.
    Durable,
    /// Fresh from the remote service.
    Network,
    /// Durable entry served because the remote failed.
    Offline,
}

/// Data from a read, with where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
    pub data: T,
    pub source: CacheSource,
    /// When the data was cached. `None` for fresh network data.
    pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
    /// Fresh rows straight from the remote.
    pub fn from_network(data: T) -> Self {
        CacheResult {
            data,
            source: CacheSource::Network,
            cached_at: None,
        }
    }

    /// Data served from `source`, cached at `cached_at`.
    pub fn from_cache(data: T, source: CacheSource, cached_at: DateTime<Utc>) -> Self {
        CacheResult {
            data,
            source,
            cached_at: Some(cached_at),
        }
    }

    /// A durable copy served because the remote failed.
    pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
        Self::from_cache(data, CacheSource::Offline, cached_at)
    }

    /// True if the data did not come straight from the remote.
    pub fn is_cached(&self) -> bool {
        self.source != CacheSource::Network
    }
}

#[derive(Debug, Clone)]
struct Cached {
    data: Value,
    cached_at: DateTime<Utc>,
}

/// When a confirmed write last outdated each `(owner, kind)`.
///
/// Durable entries cached at or before the mark are skipped by `read`.
#[derive(Debug, Default)]
struct StaleMarks {
    marks: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl StaleMarks {
    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), DateTime<Utc>>> {
        self.marks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark(&self, owner: &str, kind: &str, at: DateTime<Utc>) {
        self.lock().insert((owner.to_string(), kind.to_string()), at);
    }

    fn is_stale(&self, owner: &str, kind: &str, cached_at: DateTime<Utc>) -> bool {
        self.lock()
            .get(&(owner.to_string(), kind.to_string()))
            .is_some_and(|mark| cached_at <= *mark)
    }

    fn clear_owner(&self, owner: &str) {
        self.lock().retain(|(o, _), _| o != owner);
    }
}

// =============================================================================
// Read Path
// =============================================================================

/// The pieces a remote read needs. Cloned into preload tasks.
#[derive(Clone)]
struct ReadPath {
    memory: Arc<MemoryCache<Cached>>,
    durable: DurableCache,
    stale: Arc<StaleMarks>,
    batcher: BatcherHandle,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    query_timeout: Duration,
}

impl ReadPath {
    /// Runs `query` through the batcher and fills both tiers with the rows.
    async fn fetch(
        &self,
        owner: &str,
        key: &CacheKey,
        query: SelectQuery,
        priority: i32,
    ) -> SyncResult<Value> {
        let op = BatchOperation::query(Arc::clone(&self.remote), query, priority, self.query_timeout);
        let data = self.batcher.add_operation(op).await?.result?;
        self.populate(owner, key, &data).await;
        Ok(data)
    }

    async fn populate(&self, owner: &str, key: &CacheKey, data: &Value) {
        let cached = Cached {
            data: data.clone(),
            cached_at: self.clock.now(),
        };
        if let Err(e) = self.memory.set(owner, key, cached, None) {
            warn!(owner = %owner, key = %key, %e, "Memory cache write rejected");
        }

        match self.durable.set(owner, key, data).await {
            Ok(true) => {}
            Ok(false) => debug!(owner = %owner, key = %key, "Read not persisted to durable cache"),
            Err(e) => warn!(owner = %owner, key = %key, %e, "Durable cache write failed"),
        }
    }
}

// =============================================================================
// Event Routing
// =============================================================================

/// Outdates both cache tiers for the written kind, then forwards.
///
/// Memory entries are dropped. Durable entries stay as the offline fallback
/// but `read` stops serving them until the next network fill.
struct EngineEvents {
    memory: Arc<MemoryCache<Cached>>,
    stale: Arc<StaleMarks>,
    clock: Arc<dyn Clock>,
    forward: Arc<dyn SyncEventEmitter>,
}

impl EngineEvents {
    fn outdate(&self, owner: &str, kind: &str) {
        self.stale.mark(owner, kind, self.clock.now());
        let dropped = self.memory.invalidate_kind(owner, kind);
        debug!(owner = %owner, kind = %kind, dropped, "Cached reads outdated by confirmed write");
    }
}

impl SyncEventEmitter for EngineEvents {
    fn emit_applied(&self, owner: &str, op: &SyncOperation) {
        self.outdate(owner, &op.entity_kind);
        self.forward.emit_applied(owner, op);
    }

    fn emit_discarded(&self, owner: &str, op: &SyncOperation, remote_modified: DateTime<Utc>) {
        self.outdate(owner, &op.entity_kind);
        self.forward.emit_discarded(owner, op, remote_modified);
    }

    fn emit_dropped(&self, owner: &str, op: &SyncOperation, error: &SyncError) {
        self.forward.emit_dropped(owner, op, error);
    }

    fn emit_drained(&self, owner: &str, report: &DrainReport) {
        self.forward.emit_drained(owner, report);
    }
}

// =============================================================================
// Offline Engine
// =============================================================================

/// The offline sync and caching engine for one application session.
pub struct OfflineEngine {
    config: EngineConfig,
    store: Store,
    reads: ReadPath,
    queue: Arc<SyncQueue>,
    runner: TaskRunner<usize>,
    optimistic: OptimisticCoordinator,
    cleanup: Mutex<Option<CleanupHandle>>,
}

impl OfflineEngine {
    /// Starts building an engine.
    pub fn builder(config: EngineConfig) -> OfflineEngineBuilder {
        OfflineEngineBuilder::new(config)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the periodic memory-cache sweep. Idempotent.
    pub fn start(&self) {
        let mut cleanup = self.cleanup.lock().unwrap_or_else(|e| e.into_inner());
        if cleanup.is_none() {
            let interval = self.config.cache.cleanup_interval();
            *cleanup = Some(self.reads.memory.spawn_cleanup(interval));
            info!(interval_secs = interval.as_secs(), "Offline engine started");
        }
    }

    /// Stops the sweep, drains the batcher, and closes the store.
    ///
    /// Queued writes stay in the store for the next session.
    pub async fn shutdown(&self) {
        info!("Shutting down offline engine");

        let cleanup = self.cleanup.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = cleanup {
            handle.shutdown().await;
        }

        self.runner.clear();

        if let Err(e) = self.reads.batcher.shutdown().await {
            debug!(%e, "Batcher already stopped");
        }

        self.store.close().await;
        info!("Offline engine stopped");
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads through memory, then the durable tier, then the remote.
    ///
    /// A durable entry older than the last confirmed write of its kind is
    /// skipped.
    ///
    /// ## Errors
    /// * `SyncError::Validation` - bad owner or key
    /// * `SyncError::Remote` / `SyncError::Timeout` - nothing cached and the
    ///   remote failed
    pub async fn read(
        &self,
        owner: &str,
        key: &CacheKey,
        query: SelectQuery,
    ) -> SyncResult<CacheResult<Value>> {
        validate_owner(owner)?;
        key.validate()?;

        if let Some(hit) = self.reads.memory.get(owner, key) {
            debug!(owner = %owner, key = %key, "Memory cache hit");
            return Ok(CacheResult::from_cache(hit.data, CacheSource::Memory, hit.cached_at));
        }

        let durable = self
            .reads
            .durable
            .get_entry::<Value>(owner, key)
            .await?
            .filter(|envelope| {
                let stale = self.reads.stale.is_stale(owner, &key.kind, envelope.cached_at);
                if stale {
                    debug!(owner = %owner, key = %key, "Durable entry predates a confirmed write");
                }
                !stale
            });

        if let Some(envelope) = durable {
            debug!(owner = %owner, key = %key, "Durable cache hit");
            self.reads.memory.set(
                owner,
                key,
                Cached {
                    data: envelope.data.clone(),
                    cached_at: envelope.cached_at,
                },
                None,
            )?;
            return Ok(CacheResult::from_cache(
                envelope.data,
                CacheSource::Durable,
                envelope.cached_at,
            ));
        }

        debug!(owner = %owner, key = %key, "Cache miss, fetching");
        let data = self.reads.fetch(owner, key, query, READ_PRIORITY).await?;
        Ok(CacheResult::from_network(data))
    }

    /// Fetches from the remote, falling back to the durable tier.
    pub async fn refresh(
        &self,
        owner: &str,
        key: &CacheKey,
        query: SelectQuery,
    ) -> SyncResult<CacheResult<Value>> {
        validate_owner(owner)?;
        key.validate()?;

        match self.reads.fetch(owner, key, query, READ_PRIORITY).await {
            Ok(data) => Ok(CacheResult::from_network(data)),
            Err(e) => {
                warn!(owner = %owner, key = %key, %e, "Refresh failed, trying offline copy");
                match self.reads.durable.get_entry::<Value>(owner, key).await? {
                    Some(envelope) => Ok(CacheResult::offline(envelope.data, envelope.cached_at)),
                    None => Err(e),
                }
            }
        }
    }

    /// Schedules background reads for each date the memory tier lacks.
    ///
    /// Returns how many were scheduled.
    pub fn preload_dates<Q>(
        &self,
        owner: &str,
        kind: &str,
        dates: &[NaiveDate],
        query_for_date: Q,
    ) -> SyncResult<usize>
    where
        Q: Fn(NaiveDate) -> SelectQuery,
    {
        validate_owner(owner)?;

        let mut scheduled = 0;
        for &date in dates {
            let key = CacheKey::for_date(kind, date);
            key.validate()?;
            if self.reads.memory.has(owner, &key) {
                continue;
            }

            let reads = self.reads.clone();
            let owner_id = owner.to_string();
            let query = query_for_date(date);
            let task_id = format!("preload:{owner}:{key}");

            let task = BackgroundTask::new(task_id, move || {
                let reads = reads.clone();
                let owner = owner_id.clone();
                let key = key.clone();
                let query = query.clone();
                async move {
                    let data = reads.fetch(&owner, &key, query, PRELOAD_PRIORITY).await?;
                    Ok(data.as_array().map_or(1, Vec::len))
                }
            })
            .priority(PRELOAD_PRIORITY)
            .max_retries(1);

            self.runner.add_task(task);
            scheduled += 1;
        }

        debug!(owner = %owner, kind = %kind, scheduled, "Preload scheduled");
        Ok(scheduled)
    }

    /// Drops memory entries of `kind` for `owner`. The durable copy stays as
    /// the offline fallback.
    pub fn invalidate(&self, owner: &str, kind: &str) -> usize {
        self.reads.memory.invalidate_kind(owner, kind)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Durably queues a write and schedules a background sync.
    ///
    /// ## Errors
    /// * `SyncError::Validation` - bad owner or draft
    /// * `SyncError::QuotaExceeded` / `SyncError::Storage` - the write was not
    ///   persisted and will not be sent
    pub async fn write(&self, owner: &str, draft: SyncOperationDraft) -> SyncResult<SyncOperation> {
        let op = self.queue.enqueue(owner, draft).await?;
        self.schedule_sync(owner);
        Ok(op)
    }

    /// Queues a write as the confirming half of an optimistic update.
    ///
    /// `update`'s success callback fires once the write is durable, its error
    /// callback if it could not be queued.
    pub async fn write_optimistic<T>(
        &self,
        owner: &str,
        draft: SyncOperationDraft,
        update: OptimisticUpdate<T>,
    ) -> bool {
        let update = update.with_operation(self.write(owner, draft));
        self.optimistic.execute(update).await
    }

    /// Drains `owner`'s queue now.
    pub async fn sync_owner(&self, owner: &str) -> DrainReport {
        self.queue.drain(owner).await
    }

    /// Number of writes still waiting for the remote.
    pub async fn pending_writes(&self, owner: &str) -> SyncResult<usize> {
        self.queue.size(owner).await
    }

    /// The writes still waiting for the remote, in enqueue order.
    pub async fn pending_operations(&self, owner: &str) -> SyncResult<Vec<SyncOperation>> {
        self.queue.peek(owner).await
    }

    /// True while a drain for `owner` is running.
    pub fn is_syncing(&self, owner: &str) -> bool {
        self.queue.is_processing(owner)
    }

    fn schedule_sync(&self, owner: &str) {
        let queue = Arc::clone(&self.queue);
        let owner_id = owner.to_string();

        let task = BackgroundTask::new(sync_task_id(owner), move || {
            let queue = Arc::clone(&queue);
            let owner = owner_id.clone();
            async move {
                let report = queue.drain(&owner).await;
                let waiting = report.retried + report.unsettled;
                if waiting > 0 {
                    return Err(SyncError::TaskFailed(format!(
                        "{} writes awaiting retry",
                        waiting
                    )));
                }
                Ok(report.flushed)
            }
        })
        .priority(SYNC_PRIORITY)
        .on_error({
            let owner = owner.to_string();
            move |e| warn!(owner = %owner, %e, "Background sync gave up until the next trigger")
        });

        self.runner.add_task(task);
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Forgets everything held for `owner`: pending writes and both cache
    /// tiers. In-flight batched reads finish first.
    pub async fn logout(&self, owner: &str) -> SyncResult<()> {
        validate_owner(owner)?;

        self.reads.batcher.flush().await?;
        self.runner.remove_task(&sync_task_id(owner));
        self.queue.clear(owner).await?;

        let memory = self.reads.memory.clear_owner(owner);
        let durable = self.reads.durable.clear_owner(owner).await?;
        self.reads.stale.clear_owner(owner);

        info!(owner = %owner, memory, durable, "Owner state cleared");
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Queued and running background tasks.
    pub fn runner_status(&self) -> RunnerStatus {
        self.runner.status()
    }

    /// Entry counts for the memory tier.
    pub fn memory_stats(&self) -> CacheStats {
        self.reads.memory.stats()
    }

    /// Optimistic updates still awaiting their write.
    pub fn pending_updates(&self) -> usize {
        self.optimistic.pending_count()
    }

    /// The durable tier, for direct inspection.
    pub fn durable_cache(&self) -> &DurableCache {
        &self.reads.durable
    }

    /// The config the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn sync_task_id(owner: &str) -> String {
    format!("sync:{owner}")
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating an OfflineEngine with options.
pub struct OfflineEngineBuilder {
    config: EngineConfig,
    store: Option<Store>,
    remote: Option<Arc<dyn RemoteStore>>,
    clock: Option<Arc<dyn Clock>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl OfflineEngineBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: EngineConfig) -> Self {
        OfflineEngineBuilder {
            config,
            store: None,
            remote: None,
            clock: None,
            emitter: None,
        }
    }

    /// Uses an already opened store instead of the configured path.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the remote data service.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the wall clock. Defaults to the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Builds the engine. Must be called from within a tokio runtime.
    ///
    /// ## Errors
    /// * `SyncError::InvalidConfig` - bad config or no remote set
    /// * `SyncError::Storage` - the store could not be opened
    pub async fn build(self) -> SyncResult<OfflineEngine> {
        let OfflineEngineBuilder {
            config,
            store,
            remote,
            clock,
            emitter,
        } = self;

        config.validate()?;

        let remote = remote.ok_or_else(|| SyncError::InvalidConfig("Remote store required".into()))?;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let emitter = emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let store = match store {
            Some(store) => store,
            None => open_store(&config).await?,
        };

        let memory = Arc::new(MemoryCache::new(TtlPolicy::from_settings(&config.cache)));
        let durable = DurableCache::new(store.clone(), Arc::clone(&clock), &config.cache);

        let stale = Arc::new(StaleMarks::default());

        let events: Arc<dyn SyncEventEmitter> = Arc::new(EngineEvents {
            memory: Arc::clone(&memory),
            stale: Arc::clone(&stale),
            clock: Arc::clone(&clock),
            forward: emitter,
        });
        let queue = Arc::new(SyncQueue::new(
            store.clone(),
            Arc::clone(&remote),
            Arc::clone(&clock),
            events,
            config.queue.clone(),
        ));

        let reads = ReadPath {
            memory,
            durable,
            stale,
            batcher: RequestBatcher::start(config.batcher.clone()),
            remote,
            clock,
            query_timeout: config.batcher.query_timeout(),
        };

        info!(
            max_retries = config.queue.max_retries,
            max_concurrent = config.runner.max_concurrent,
            "Offline engine built"
        );

        Ok(OfflineEngine {
            runner: TaskRunner::new(config.runner.clone()),
            config,
            store,
            reads,
            queue,
            optimistic: OptimisticCoordinator::new(),
            cleanup: Mutex::new(None),
        })
    }
}

async fn open_store(config: &EngineConfig) -> SyncResult<Store> {
    let path = config.database_path();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut store_config = StoreConfig::new(path);
    store_config.quota_bytes = config.store.quota_bytes;
    Ok(Store::new(store_config).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use holdfast_core::{ManualClock, SyncAction};
    use serde_json::json;

    async fn engine(remote: Arc<InMemoryRemote>) -> OfflineEngine {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        OfflineEngine::builder(EngineConfig::default())
            .with_store(store)
            .with_remote(remote)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_remote() {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let result = OfflineEngine::builder(EngineConfig::default())
            .with_store(store)
            .build()
            .await;

        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.batcher.max_batch_size = 0;

        let result = OfflineEngine::builder(config)
            .with_remote(Arc::new(InMemoryRemote::default()))
            .build()
            .await;

        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_read_walks_the_tiers() {
        let remote = Arc::new(InMemoryRemote::default());
        remote.seed(
            "profiles",
            "u1",
            json!({ "id": "u1", "name": "Sam" }).as_object().unwrap().clone(),
            Utc::now(),
        );
        let engine = engine(remote.clone()).await;
        let key = CacheKey::new("profiles");
        let query = || SelectQuery::new("profiles").eq("id", "u1");

        let first = engine.read("u1", &key, query()).await.unwrap();
        assert_eq!(first.source, CacheSource::Network);
        assert_eq!(first.data, json!([{ "id": "u1", "name": "Sam" }]));

        let second = engine.read("u1", &key, query()).await.unwrap();
        assert_eq!(second.source, CacheSource::Memory);

        assert_eq!(engine.invalidate("u1", "profiles"), 1);
        let third = engine.read("u1", &key, query()).await.unwrap();
        assert_eq!(third.source, CacheSource::Durable);
        assert_eq!(third.data, first.data);
    }

    #[tokio::test]
    async fn test_refresh_falls_back_offline() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let remote = Arc::new(InMemoryRemote::new(clock.clone()));
        let engine = engine(remote.clone()).await;
        let key = CacheKey::new("macro_goals");
        let query = || SelectQuery::new("macro_goals");

        engine.refresh("u1", &key, query()).await.unwrap();
        remote.set_offline(true);

        let offline = engine.refresh("u1", &key, query()).await.unwrap();
        assert_eq!(offline.source, CacheSource::Offline);
        assert!(offline.cached_at.is_some());

        let missing = engine.refresh("u1", &CacheKey::new("meals"), SelectQuery::new("meals")).await;
        assert!(missing.is_err());
    }

    #[test]
    fn test_stale_marks_cover_entries_cached_up_to_the_mark() {
        let marks = StaleMarks::default();
        let at = Utc::now();
        assert!(!marks.is_stale("u1", "meals", at));

        marks.mark("u1", "meals", at);
        assert!(marks.is_stale("u1", "meals", at - chrono::Duration::seconds(1)));
        assert!(marks.is_stale("u1", "meals", at));
        assert!(!marks.is_stale("u1", "meals", at + chrono::Duration::seconds(1)));
        assert!(!marks.is_stale("u1", "profiles", at));
        assert!(!marks.is_stale("u2", "meals", at));

        marks.clear_owner("u1");
        assert!(!marks.is_stale("u1", "meals", at));
    }

    #[tokio::test]
    async fn test_write_invalidates_memory_kind_on_apply() {
        let remote = Arc::new(InMemoryRemote::default());
        let engine = engine(remote.clone()).await;
        let key = CacheKey::new("meals");

        engine.read("u1", &key, SelectQuery::new("meals")).await.unwrap();
        assert_eq!(engine.memory_stats().valid, 1);

        let draft = SyncOperationDraft::new(
            SyncAction::Insert,
            "meals",
            "m-1",
            json!({ "id": "m-1" }).as_object().unwrap().clone(),
        );
        engine.write("u1", draft).await.unwrap();
        engine.sync_owner("u1").await;

        // The scheduled background drain may be the one that applies it
        for _ in 0..100 {
            if engine.memory_stats().valid == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(remote.row("meals", "m-1").is_some());
        assert_eq!(engine.memory_stats().valid, 0);
        assert_eq!(engine.pending_writes("u1").await.unwrap(), 0);
    }
}
