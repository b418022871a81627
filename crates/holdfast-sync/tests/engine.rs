//! Integration Tests for the Offline Engine
//!
//! End-to-end flows through `OfflineEngine` against `InMemoryRemote`, with an
//! in-memory store unless a test needs a file that outlives the engine.
//!
//! # Test Organization
//! - `offline_*` - writes while the remote is unreachable
//! - `conflict_*` - staleness and retry exhaustion
//! - `read_*` - tiered reads and preloading
//! - `session_*` - optimistic writes, logout, restart

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use holdfast_core::{CacheKey, Payload, SyncAction, SyncOperation, SyncOperationDraft};
use holdfast_store::{Store, StoreConfig};
use serde_json::{json, Value};

use holdfast_sync::{
    CacheSource, DrainReport, EngineConfig, InMemoryRemote, OfflineEngine, OptimisticUpdate,
    RemoteMethod, SelectQuery, SyncError, SyncEventEmitter,
};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct RecordingEmitter {
    applied: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
}

impl SyncEventEmitter for RecordingEmitter {
    fn emit_applied(&self, _owner: &str, op: &SyncOperation) {
        self.applied.lock().unwrap().push(op.record_id.clone());
    }

    fn emit_discarded(
        &self,
        _owner: &str,
        op: &SyncOperation,
        _remote_modified: chrono::DateTime<Utc>,
    ) {
        self.discarded.lock().unwrap().push(op.record_id.clone());
    }

    fn emit_dropped(&self, _owner: &str, op: &SyncOperation, _error: &SyncError) {
        self.dropped.lock().unwrap().push(op.record_id.clone());
    }

    fn emit_drained(&self, _owner: &str, _report: &DrainReport) {}
}

struct TestEngine {
    engine: OfflineEngine,
    remote: Arc<InMemoryRemote>,
    events: Arc<RecordingEmitter>,
}

async fn test_engine(config: EngineConfig) -> TestEngine {
    let store = Store::new(StoreConfig::in_memory()).await.unwrap();
    let remote = Arc::new(InMemoryRemote::default());
    let events = Arc::new(RecordingEmitter::default());

    let engine = OfflineEngine::builder(config)
        .with_store(store)
        .with_remote(remote.clone())
        .with_emitter(events.clone())
        .build()
        .await
        .unwrap();

    TestEngine {
        engine,
        remote,
        events,
    }
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("payload must be an object"),
    }
}

fn meal(id: &str) -> SyncOperationDraft {
    SyncOperationDraft::new(
        SyncAction::Insert,
        "meals",
        id,
        payload(json!({ "id": id, "user_id": "u1", "kcal": 420 })),
    )
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("holdfast_{}_{}.db", name, uuid::Uuid::new_v4()))
}

fn remove_db_files(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.clone().into_os_string();
        file.push(suffix);
        let _ = std::fs::remove_file(file);
    }
}

// =============================================================================
// Offline Writes
// =============================================================================

#[tokio::test]
async fn offline_writes_survive_and_flush_on_reconnect() {
    let t = test_engine(EngineConfig::default()).await;
    t.remote.set_offline(true);

    t.engine.write("u1", meal("m-1")).await.unwrap();
    t.engine.write("u1", meal("m-2")).await.unwrap();
    assert_eq!(t.engine.pending_writes("u1").await.unwrap(), 2);
    assert_eq!(t.remote.row_count("meals"), 0);

    t.remote.set_offline(false);
    t.engine.sync_owner("u1").await;

    let engine = &t.engine;
    assert!(eventually(|| async move { engine.pending_writes("u1").await.unwrap() == 0 }).await);
    assert_eq!(t.remote.row_count("meals"), 2);

    let mut applied = t.events.applied.lock().unwrap().clone();
    applied.sort();
    assert_eq!(applied, vec!["m-1", "m-2"]);
}

#[tokio::test]
async fn offline_failed_attempts_are_counted_on_the_operation() {
    let t = test_engine(EngineConfig::default()).await;
    t.remote.set_offline(true);

    t.engine.write("u1", meal("m-1")).await.unwrap();
    t.engine.sync_owner("u1").await;

    let engine = &t.engine;
    assert!(
        eventually(|| async move {
            engine
                .pending_operations("u1")
                .await
                .unwrap()
                .first()
                .map_or(false, |op| op.retry_count >= 1)
        })
        .await
    );
    assert!(t.events.applied.lock().unwrap().is_empty());
}

// =============================================================================
// Conflicts and Exhaustion
// =============================================================================

#[tokio::test]
async fn conflict_stale_update_is_discarded_without_remote_update() {
    let t = test_engine(EngineConfig::default()).await;
    let local_edit = Utc.with_ymd_and_hms(2024, 3, 9, 8, 0, 0).unwrap();
    let remote_edit = Utc.with_ymd_and_hms(2024, 3, 9, 8, 10, 0).unwrap();

    t.remote.seed(
        "macro_goals",
        "g-1",
        payload(json!({ "id": "g-1", "protein": 150 })),
        remote_edit,
    );

    let draft = SyncOperationDraft::new(
        SyncAction::Update,
        "macro_goals",
        "g-1",
        payload(json!({ "protein": 120 })),
    )
    .with_timestamp(local_edit);
    t.engine.write("u1", draft).await.unwrap();

    let engine = &t.engine;
    assert!(eventually(|| async move { engine.pending_writes("u1").await.unwrap() == 0 }).await);

    assert_eq!(*t.events.discarded.lock().unwrap(), vec!["g-1"]);
    assert_eq!(t.remote.call_count(RemoteMethod::Update), 0);
    assert_eq!(t.remote.row("macro_goals", "g-1").unwrap()["protein"], json!(150));
}

#[tokio::test]
async fn conflict_exhausted_write_is_dropped_and_reported() {
    let mut config = EngineConfig::default();
    config.queue.max_retries = 2;
    let t = test_engine(config).await;
    t.remote.set_offline(true);

    t.engine.write("u1", meal("m-1")).await.unwrap();

    let engine = &t.engine;
    let drained = eventually(|| async move {
        engine.sync_owner("u1").await;
        engine.pending_writes("u1").await.unwrap() == 0
    })
    .await;

    assert!(drained);
    assert_eq!(*t.events.dropped.lock().unwrap(), vec!["m-1"]);
    assert_eq!(t.remote.row_count("meals"), 0);
}

#[tokio::test]
async fn conflict_duplicate_insert_counts_as_applied() {
    let t = test_engine(EngineConfig::default()).await;
    t.remote.seed(
        "meals",
        "m-1",
        payload(json!({ "id": "m-1" })),
        Utc::now(),
    );

    t.engine.write("u1", meal("m-1")).await.unwrap();

    let engine = &t.engine;
    assert!(eventually(|| async move { engine.pending_writes("u1").await.unwrap() == 0 }).await);
    assert_eq!(*t.events.applied.lock().unwrap(), vec!["m-1"]);
    assert!(t.events.dropped.lock().unwrap().is_empty());
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
async fn read_after_confirmed_write_sees_the_new_row() {
    let t = test_engine(EngineConfig::default()).await;
    let key = CacheKey::new("meals");
    let query = || SelectQuery::new("meals").eq("user_id", "u1");

    let empty = t.engine.read("u1", &key, query()).await.unwrap();
    assert_eq!(empty.source, CacheSource::Network);
    assert_eq!(empty.data, json!([]));

    t.engine.write("u1", meal("m-1")).await.unwrap();
    let engine = &t.engine;
    assert!(eventually(|| async move { engine.pending_writes("u1").await.unwrap() == 0 }).await);
    assert!(eventually(|| async move { engine.memory_stats().valid == 0 }).await);

    // The durable copy still holds the empty answer and must not be served
    let fresh = t.engine.read("u1", &key, query()).await.unwrap();
    assert_eq!(fresh.source, CacheSource::Network);
    assert_eq!(fresh.data.as_array().unwrap().len(), 1);

    let again = t.engine.read("u1", &key, query()).await.unwrap();
    assert_eq!(again.source, CacheSource::Memory);
    assert_eq!(again.data, fresh.data);

    // The network fill replaced the durable copy, so it is served again
    assert_eq!(t.engine.invalidate("u1", "meals"), 1);
    let durable = t.engine.read("u1", &key, query()).await.unwrap();
    assert_eq!(durable.source, CacheSource::Durable);
    assert_eq!(durable.data, fresh.data);
}

#[tokio::test]
async fn read_offline_after_confirmed_write_keeps_the_durable_copy() {
    let t = test_engine(EngineConfig::default()).await;
    let key = CacheKey::new("meals");
    let query = || SelectQuery::new("meals").eq("user_id", "u1");

    t.engine.read("u1", &key, query()).await.unwrap();
    t.engine.write("u1", meal("m-1")).await.unwrap();
    let events = &t.events;
    assert!(eventually(|| async move { !events.applied.lock().unwrap().is_empty() }).await);

    t.remote.set_offline(true);
    assert!(t.engine.read("u1", &key, query()).await.is_err());

    let offline = t.engine.refresh("u1", &key, query()).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data, json!([]));
}

#[tokio::test]
async fn read_preload_fills_both_tiers() {
    let t = test_engine(EngineConfig::default()).await;
    let dates: Vec<NaiveDate> = (1..=3)
        .map(|d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap())
        .collect();

    for date in &dates {
        let id = format!("log-{date}");
        t.remote.seed(
            "nutrition_logs",
            &id,
            payload(json!({ "id": id, "user_id": "u1", "date": date.to_string() })),
            Utc::now(),
        );
    }

    let query_for = |date: NaiveDate| {
        SelectQuery::new("nutrition_logs")
            .eq("user_id", "u1")
            .eq("date", date.to_string())
    };

    let scheduled = t
        .engine
        .preload_dates("u1", "nutrition_logs", &dates, query_for)
        .unwrap();
    assert_eq!(scheduled, 3);

    let engine = &t.engine;
    let dates_ref = &dates;
    assert!(
        eventually(|| async move {
            for date in dates_ref {
                let key = CacheKey::for_date("nutrition_logs", *date);
                if !engine.durable_cache().has("u1", &key).await.unwrap() {
                    return false;
                }
            }
            true
        })
        .await
    );

    let key = CacheKey::for_date("nutrition_logs", dates[1]);
    let hit = t.engine.read("u1", &key, query_for(dates[1])).await.unwrap();
    assert_eq!(hit.source, CacheSource::Memory);
    assert_eq!(hit.data[0]["date"], json!("2024-03-02"));

    // Already in memory, nothing to do
    let again = t
        .engine
        .preload_dates("u1", "nutrition_logs", &dates, query_for)
        .unwrap();
    assert_eq!(again, 0);
}

// =============================================================================
// Session
// =============================================================================

#[tokio::test]
async fn session_optimistic_write_confirms_or_rolls_back() {
    let t = test_engine(EngineConfig::default()).await;

    let confirmed = Arc::new(Mutex::new(None));
    let update = OptimisticUpdate::new("meal-m-1", 420, 0).on_success({
        let confirmed = confirmed.clone();
        move |kcal| *confirmed.lock().unwrap() = Some(kcal)
    });
    assert!(t.engine.write_optimistic("u1", meal("m-1"), update).await);
    assert_eq!(*confirmed.lock().unwrap(), Some(420));

    let rolled_back = Arc::new(Mutex::new(None));
    let update = OptimisticUpdate::new("meal-bad", 500, 0).on_error({
        let rolled_back = rolled_back.clone();
        move |err, kcal| *rolled_back.lock().unwrap() = Some((matches!(err, SyncError::Validation(_)), kcal))
    });
    assert!(!t.engine.write_optimistic("u1", meal(""), update).await);
    assert_eq!(*rolled_back.lock().unwrap(), Some((true, 0)));
    assert_eq!(t.engine.pending_updates(), 0);
}

#[tokio::test]
async fn session_logout_forgets_owner_state() {
    let t = test_engine(EngineConfig::default()).await;
    let key = CacheKey::new("profiles");

    t.engine
        .read("u1", &key, SelectQuery::new("profiles"))
        .await
        .unwrap();
    t.engine
        .read("u2", &key, SelectQuery::new("profiles"))
        .await
        .unwrap();
    t.remote.set_offline(true);
    t.engine.write("u1", meal("m-1")).await.unwrap();

    t.engine.logout("u1").await.unwrap();

    assert_eq!(t.engine.pending_writes("u1").await.unwrap(), 0);
    assert!(!t.engine.durable_cache().has("u1", &key).await.unwrap());
    assert!(t.engine.durable_cache().has("u2", &key).await.unwrap());
    assert_eq!(t.engine.memory_stats().total, 1);
}

#[tokio::test]
async fn session_queued_writes_outlive_the_engine() {
    let path = temp_db_path("restart");
    let mut config = EngineConfig::default();
    config.store.path = Some(path.clone());

    let remote = Arc::new(InMemoryRemote::default());
    remote.set_offline(true);

    let first = OfflineEngine::builder(config.clone())
        .with_remote(remote.clone())
        .build()
        .await
        .unwrap();
    first.write("u1", meal("m-1")).await.unwrap();
    first.shutdown().await;

    remote.set_offline(false);
    let second = OfflineEngine::builder(config)
        .with_remote(remote.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(second.pending_writes("u1").await.unwrap(), 1);

    let report = second.sync_owner("u1").await;
    assert_eq!(report.flushed, 1);
    assert!(remote.row("meals", "m-1").is_some());

    second.shutdown().await;
    remove_db_files(&path);
}
