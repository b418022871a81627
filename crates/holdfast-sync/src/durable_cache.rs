//! # Durable Cache
//!
//! Restart-surviving cache tier on the shared store, the offline fallback for
//! every read.
//!
//! ## Storage Layout
//! ```text
//! key:   cache:{owner}:{kind}[:{YYYY-MM-DD}]
//! value: { "data": <value>, "cached_at": "<rfc3339>", "version": 1 }
//! ```
//!
//! ## Quota Handling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  put ──► QuotaExceeded?                                                 │
//! │             │ yes                                                       │
//! │             ▼                                                           │
//! │  prune prunable kinds older than the retention window                  │
//! │  (undecodable envelopes go too)                                         │
//! │             │                                                           │
//! │             ▼                                                           │
//! │  put again ──► ok: stored                                               │
//! │            └─► fail: write dropped, set returns false                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cache writes are never fatal to the caller. Queue records live in their
//! own namespace and are never pruned here.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use holdfast_core::validation::validate_owner;
use holdfast_core::{CacheKey, Clock};
use holdfast_store::{Namespace, Store};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::CacheSettings;
use crate::error::SyncResult;

/// Envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// What is stored for each cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
    pub version: u32,
}

/// Cache tier backed by the durable store.
#[derive(Debug, Clone)]
pub struct DurableCache {
    store: Store,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    prunable_kinds: Vec<String>,
}

impl DurableCache {
    /// Creates a durable cache over `store`.
    pub fn new(store: Store, clock: Arc<dyn Clock>, settings: &CacheSettings) -> Self {
        DurableCache {
            store,
            clock,
            retention: settings.retention(),
            prunable_kinds: settings.prunable_kinds.clone(),
        }
    }

    fn storage_key(owner: &str, key: &CacheKey) -> SyncResult<String> {
        validate_owner(owner)?;
        Ok(Namespace::Cache.key(owner, &key.to_string()))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores `value` under `(owner, key)`.
    ///
    /// Returns `Ok(false)` when the write had to be dropped (storage full even
    /// after pruning, or any other storage failure).
    ///
    /// ## Errors
    /// * `SyncError::Validation` - `owner` is empty or contains the key
    ///   separator
    /// * `SyncError::SerializationFailed` - `value` cannot be encoded
    pub async fn set<T: Serialize>(&self, owner: &str, key: &CacheKey, value: &T) -> SyncResult<bool> {
        let envelope = CacheEnvelope {
            data: value,
            cached_at: self.clock.now(),
            version: ENVELOPE_VERSION,
        };
        let storage_key = Self::storage_key(owner, key)?;
        let encoded = serde_json::to_string(&envelope)?;
        let entries = self.store.entries();

        match entries.put(&storage_key, &encoded).await {
            Ok(()) => {
                debug!(owner = %owner, key = %key, "Durable cache set");
                Ok(true)
            }
            Err(e) if e.is_quota_exceeded() => {
                warn!(owner = %owner, key = %key, "Storage full, pruning old cache entries");

                match self.prune_expired(owner).await {
                    Ok(pruned) => info!(owner = %owner, pruned, "Pruned cache entries for space"),
                    Err(e) => warn!(owner = %owner, ?e, "Cache pruning failed"),
                }

                match entries.put(&storage_key, &encoded).await {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        warn!(owner = %owner, key = %key, ?e, "Dropping cache write after pruning");
                        Ok(false)
                    }
                }
            }
            Err(e) => {
                error!(owner = %owner, key = %key, ?e, "Durable cache write failed");
                Ok(false)
            }
        }
    }

    /// [`set`](Self::set) for a date bucket.
    pub async fn set_for_date<T: Serialize>(
        &self,
        owner: &str,
        kind: &str,
        date: NaiveDate,
        value: &T,
    ) -> SyncResult<bool> {
        self.set(owner, &CacheKey::for_date(kind, date), value).await
    }

    /// Removes one entry.
    pub async fn remove(&self, owner: &str, key: &CacheKey) -> SyncResult<bool> {
        Ok(self
            .store
            .entries()
            .remove(&Self::storage_key(owner, key)?)
            .await?)
    }

    /// [`remove`](Self::remove) for a date bucket.
    pub async fn remove_for_date(&self, owner: &str, kind: &str, date: NaiveDate) -> SyncResult<bool> {
        self.remove(owner, &CacheKey::for_date(kind, date)).await
    }

    /// Removes every entry for `owner`.
    pub async fn clear_owner(&self, owner: &str) -> SyncResult<u64> {
        validate_owner(owner)?;
        let removed = self
            .store
            .entries()
            .remove_prefix(&Namespace::Cache.scan_prefix(owner))
            .await?;
        debug!(owner = %owner, removed, "Durable cache cleared");
        Ok(removed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the full envelope. Undecodable envelopes read as absent.
    pub async fn get_entry<T: DeserializeOwned>(
        &self,
        owner: &str,
        key: &CacheKey,
    ) -> SyncResult<Option<CacheEnvelope<T>>> {
        let storage_key = Self::storage_key(owner, key)?;
        let Some(raw) = self.store.entries().get(&storage_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<CacheEnvelope<T>>(&raw) {
            Ok(envelope) if envelope.version == ENVELOPE_VERSION => Ok(Some(envelope)),
            Ok(envelope) => {
                warn!(key = %storage_key, version = envelope.version, "Unknown cache envelope version");
                Ok(None)
            }
            Err(e) => {
                warn!(key = %storage_key, ?e, "Corrupt cache envelope");
                Ok(None)
            }
        }
    }

    /// Returns the cached value.
    pub async fn get<T: DeserializeOwned>(&self, owner: &str, key: &CacheKey) -> SyncResult<Option<T>> {
        Ok(self.get_entry(owner, key).await?.map(|e| e.data))
    }

    /// [`get`](Self::get) for a date bucket.
    pub async fn get_for_date<T: DeserializeOwned>(
        &self,
        owner: &str,
        kind: &str,
        date: NaiveDate,
    ) -> SyncResult<Option<T>> {
        self.get(owner, &CacheKey::for_date(kind, date)).await
    }

    /// True if a readable entry exists.
    pub async fn has(&self, owner: &str, key: &CacheKey) -> SyncResult<bool> {
        Ok(self.get_entry::<Value>(owner, key).await?.is_some())
    }

    /// When the entry was written.
    pub async fn cached_at(&self, owner: &str, key: &CacheKey) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self
            .get_entry::<Value>(owner, key)
            .await?
            .map(|e| e.cached_at))
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    /// Removes entries of `kind` for `owner` cached before `cutoff`, plus any
    /// of that kind that cannot be decoded.
    pub async fn prune_kind_before(
        &self,
        owner: &str,
        kind: &str,
        cutoff: DateTime<Utc>,
    ) -> SyncResult<u64> {
        validate_owner(owner)?;
        let entries = self.store.entries();
        let rows = entries
            .scan_prefix(&Namespace::Cache.scan_prefix(owner))
            .await?;

        let mut removed = 0;
        for row in rows {
            let Some((_, suffix)) = Namespace::Cache.split(&row.key) else {
                continue;
            };
            if CacheKey::parse(suffix).map_or(true, |k| k.kind != kind) {
                continue;
            }

            let stale = match serde_json::from_str::<CacheEnvelope<Value>>(&row.value) {
                Ok(envelope) => envelope.cached_at < cutoff,
                Err(_) => true,
            };

            if stale && entries.remove(&row.key).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Prunes every prunable kind past the retention window for `owner`.
    pub async fn prune_expired(&self, owner: &str) -> SyncResult<u64> {
        let cutoff = self.clock.now() - self.retention;
        let mut removed = 0;

        for kind in &self.prunable_kinds {
            removed += self.prune_kind_before(owner, kind, cutoff).await?;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use chrono::TimeZone;
    use holdfast_core::ManualClock;
    use holdfast_store::StoreConfig;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    async fn cache(quota: Option<u64>) -> (DurableCache, Arc<ManualClock>) {
        let mut config = StoreConfig::in_memory();
        config.quota_bytes = quota;
        let store = Store::new(config).await.unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let cache = DurableCache::new(store, clock.clone(), &CacheSettings::default());
        (cache, clock)
    }

    fn blob(n: usize) -> Value {
        json!({ "notes": "x".repeat(n) })
    }

    #[tokio::test]
    async fn test_set_get_envelope() {
        let (cache, _) = cache(None).await;
        let key = CacheKey::new("profiles");

        assert!(cache.get::<Value>("u1", &key).await.unwrap().is_none());
        assert!(cache.set("u1", &key, &json!({ "name": "Sam" })).await.unwrap());

        let entry = cache.get_entry::<Value>("u1", &key).await.unwrap().unwrap();
        assert_eq!(entry.data, json!({ "name": "Sam" }));
        assert_eq!(entry.cached_at, start());
        assert_eq!(entry.version, ENVELOPE_VERSION);
        assert!(cache.has("u1", &key).await.unwrap());
        assert!(!cache.has("u2", &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_owner_cannot_reach_another_owners_keys() {
        let (cache, _) = cache(None).await;
        let key = CacheKey::new("profiles");
        cache.set("u1", &CacheKey::new("meals"), &json!([1])).await.unwrap();

        // Would otherwise land under "cache:u1:"
        assert!(matches!(
            cache.set("u1:meals", &key, &json!([])).await,
            Err(SyncError::Validation(_))
        ));
        assert!(cache.get::<Value>("u1:meals", &key).await.is_err());
        assert!(cache.remove("u1:meals", &key).await.is_err());
        assert!(cache.clear_owner("").await.is_err());

        assert_eq!(
            cache.get::<Value>("u1", &CacheKey::new("meals")).await.unwrap(),
            Some(json!([1]))
        );
    }

    #[tokio::test]
    async fn test_corrupt_envelope_reads_absent() {
        let (cache, _) = cache(None).await;
        let key = CacheKey::new("profiles");

        cache
            .store
            .entries()
            .put(&Namespace::Cache.key("u1", "profiles"), "{not json")
            .await
            .unwrap();

        assert!(cache.get::<Value>("u1", &key).await.unwrap().is_none());
        assert!(!cache.has("u1", &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_date_buckets_and_clear_owner() {
        let (cache, _) = cache(None).await;

        cache.set_for_date("u1", "meals", date(1), &json!([1])).await.unwrap();
        cache.set_for_date("u1", "meals", date(2), &json!([2])).await.unwrap();
        cache.set_for_date("u10", "meals", date(1), &json!([3])).await.unwrap();

        assert_eq!(
            cache.get_for_date::<Value>("u1", "meals", date(2)).await.unwrap(),
            Some(json!([2]))
        );
        assert!(cache.remove_for_date("u1", "meals", date(2)).await.unwrap());

        assert_eq!(cache.clear_owner("u1").await.unwrap(), 1);
        assert!(cache.get_for_date::<Value>("u10", "meals", date(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prune_kind_before() {
        let (cache, clock) = cache(None).await;

        cache.set_for_date("u1", "nutrition_logs", date(1), &json!([])).await.unwrap();
        clock.advance(chrono::Duration::days(3));
        cache.set_for_date("u1", "nutrition_logs", date(4), &json!([])).await.unwrap();
        cache.set("u1", &CacheKey::new("profiles"), &json!({})).await.unwrap();

        let cutoff = start() + chrono::Duration::days(1);
        assert_eq!(cache.prune_kind_before("u1", "nutrition_logs", cutoff).await.unwrap(), 1);
        assert!(cache.get_for_date::<Value>("u1", "nutrition_logs", date(4)).await.unwrap().is_some());
        assert!(cache.has("u1", &CacheKey::new("profiles")).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_prunes_old_entries_then_retries() {
        // Each entry is roughly 1.1 KB; two fit under the quota, three do not.
        let (cache, clock) = cache(Some(2500)).await;

        assert!(cache.set_for_date("u1", "nutrition_logs", date(1), &blob(1000)).await.unwrap());
        assert!(cache.set_for_date("u1", "hydration_logs", date(1), &blob(1000)).await.unwrap());

        clock.advance(chrono::Duration::days(8));

        let key = CacheKey::new("profiles");
        assert!(cache.set("u1", &key, &blob(1000)).await.unwrap());

        assert!(cache.has("u1", &key).await.unwrap());
        assert!(cache
            .get_for_date::<Value>("u1", "nutrition_logs", date(1))
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .get_for_date::<Value>("u1", "hydration_logs", date(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_quota_drops_write_when_nothing_to_prune() {
        let (cache, clock) = cache(Some(2500)).await;

        assert!(cache.set("u1", &CacheKey::new("profiles"), &blob(1000)).await.unwrap());
        assert!(cache.set_for_date("u1", "nutrition_logs", date(1), &blob(1000)).await.unwrap());

        // Still inside the retention window: nothing is eligible
        clock.advance(chrono::Duration::days(2));

        let key = CacheKey::new("macro_goals");
        assert!(!cache.set("u1", &key, &blob(1000)).await.unwrap());
        assert!(cache.get::<Value>("u1", &key).await.unwrap().is_none());
        assert!(cache
            .get_for_date::<Value>("u1", "nutrition_logs", date(1))
            .await
            .unwrap()
            .is_some());
    }
}
