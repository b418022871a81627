//! # Memory Cache
//!
//! Process-lifetime TTL cache, the first tier of every read.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  owner ─► CacheKey ─► Entry { value, cached_at, expires_at }            │
//! │                                                                         │
//! │  get:      expired entries are evicted on access and reported absent   │
//! │  cleanup:  periodic sweep removes whatever expired in between           │
//! │  TTL:      explicit per call, else per kind, else the default          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Expiry runs on `tokio::time::Instant`, so paused-clock tests advance it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use holdfast_core::validation::validate_owner;
use holdfast_core::CacheKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::CacheSettings;
use crate::error::SyncResult;

// =============================================================================
// TTL Policy
// =============================================================================

/// Time-to-live per entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    default: Duration,
    per_kind: HashMap<String, Duration>,
}

impl TtlPolicy {
    /// Same TTL for every kind.
    pub fn uniform(ttl: Duration) -> Self {
        TtlPolicy {
            default: ttl,
            per_kind: HashMap::new(),
        }
    }

    /// Overrides the TTL for one kind.
    pub fn with_kind(mut self, kind: impl Into<String>, ttl: Duration) -> Self {
        self.per_kind.insert(kind.into(), ttl);
        self
    }

    /// Builds the policy from cache settings.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        TtlPolicy {
            default: Duration::from_secs(settings.default_ttl_secs),
            per_kind: settings
                .kind_ttl_secs
                .iter()
                .map(|(kind, secs)| (kind.clone(), Duration::from_secs(*secs)))
                .collect(),
        }
    }

    /// TTL for `kind`.
    pub fn ttl_for(&self, kind: &str) -> Duration {
        self.per_kind.get(kind).copied().unwrap_or(self.default)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

// =============================================================================
// Memory Cache
// =============================================================================

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    cached_at: Instant,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Entry counts at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

/// In-memory TTL cache keyed by `(owner, CacheKey)`.
#[derive(Debug)]
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, HashMap<CacheKey, Entry<V>>>>,
    policy: TtlPolicy,
}

impl<V: Clone + Send + 'static> MemoryCache<V> {
    /// Creates an empty cache.
    pub fn new(policy: TtlPolicy) -> Self {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<CacheKey, Entry<V>>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a value. `ttl` of `None` uses the kind's policy TTL.
    ///
    /// ## Errors
    /// * `SyncError::Validation` - `owner` is empty or contains the key
    ///   separator
    pub fn set(&self, owner: &str, key: &CacheKey, value: V, ttl: Option<Duration>) -> SyncResult<()> {
        validate_owner(owner)?;
        let ttl = ttl.unwrap_or_else(|| self.policy.ttl_for(&key.kind));
        let now = Instant::now();

        self.lock().entry(owner.to_string()).or_default().insert(
            key.clone(),
            Entry {
                value,
                cached_at: now,
                expires_at: now + ttl,
            },
        );

        debug!(owner = %owner, key = %key, ttl_ms = ttl.as_millis() as u64, "Memory cache set");
        Ok(())
    }

    /// Returns the value if present and not expired. Expired entries are evicted.
    ///
    /// An invalid owner never has entries.
    pub fn get(&self, owner: &str, key: &CacheKey) -> Option<V> {
        if validate_owner(owner).is_err() {
            return None;
        }
        let now = Instant::now();
        let mut entries = self.lock();
        let owned = entries.get_mut(owner)?;

        match owned.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                owned.remove(key);
                if owned.is_empty() {
                    entries.remove(owner);
                }
                None
            }
            None => None,
        }
    }

    /// Age of a live entry.
    pub fn age(&self, owner: &str, key: &CacheKey) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(owner)
            .and_then(|owned| owned.get(key))
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| now.saturating_duration_since(entry.cached_at))
    }

    /// True if [`get`](Self::get) would return a value.
    pub fn has(&self, owner: &str, key: &CacheKey) -> bool {
        self.get(owner, key).is_some()
    }

    /// True when a caller should go to the network for this key.
    pub fn should_fetch(&self, owner: &str, key: &CacheKey) -> bool {
        !self.has(owner, key)
    }

    /// Removes one entry.
    pub fn remove(&self, owner: &str, key: &CacheKey) -> bool {
        if validate_owner(owner).is_err() {
            return false;
        }
        let mut entries = self.lock();
        let Some(owned) = entries.get_mut(owner) else {
            return false;
        };
        let removed = owned.remove(key).is_some();
        if owned.is_empty() {
            entries.remove(owner);
        }
        removed
    }

    /// Removes every entry of `kind` for `owner`, dated or not.
    pub fn invalidate_kind(&self, owner: &str, kind: &str) -> usize {
        let mut entries = self.lock();
        let Some(owned) = entries.get_mut(owner) else {
            return 0;
        };

        let before = owned.len();
        owned.retain(|key, _| key.kind != kind);
        let removed = before - owned.len();
        if owned.is_empty() {
            entries.remove(owner);
        }

        if removed > 0 {
            debug!(owner = %owner, kind = %kind, removed, "Memory cache kind invalidated");
        }
        removed
    }

    /// Removes every entry for `owner`.
    pub fn clear_owner(&self, owner: &str) -> usize {
        self.lock().remove(owner).map_or(0, |owned| owned.len())
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Removes expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let mut removed = 0;

        for owned in entries.values_mut() {
            let before = owned.len();
            owned.retain(|_, entry| !entry.is_expired(now));
            removed += before - owned.len();
        }
        entries.retain(|_, owned| !owned.is_empty());

        removed
    }

    /// Counts entries by liveness.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.lock();
        let mut stats = CacheStats::default();

        for entry in entries.values().flat_map(|owned| owned.values()) {
            stats.total += 1;
            if entry.is_expired(now) {
                stats.expired += 1;
            } else {
                stats.valid += 1;
            }
        }

        stats
    }

    /// Starts the periodic expiry sweep.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let cache = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.cleanup();
                        if removed > 0 {
                            debug!(removed, "Memory cache sweep");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Memory cache sweep stopped");
                        break;
                    }
                }
            }
        });

        CleanupHandle { shutdown_tx, task }
    }
}

/// Handle to a running sweep. Dropping it also stops the sweep.
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Stops the sweep and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> CacheKey {
        CacheKey::for_date("nutrition_logs", NaiveDate::from_ymd_opt(2024, 3, d).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = MemoryCache::new(TtlPolicy::uniform(Duration::from_secs(60)));
        let key = CacheKey::new("weight_logs");

        cache.set("u1", &key, 42, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(cache.get("u1", &key), Some(42));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.has("u1", &key));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("u1", &key), None);
        assert_eq!(cache.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kind_policy_applies_without_explicit_ttl() {
        let cache = MemoryCache::new(TtlPolicy::default());
        let meals = CacheKey::new("meals");
        let profile = CacheKey::new("profiles");

        cache.set("u1", &meals, "m", None).unwrap();
        cache.set("u1", &profile, "p", None).unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(cache.should_fetch("u1", &meals));
        assert!(!cache.should_fetch("u1", &profile));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_stats() {
        let cache = MemoryCache::new(TtlPolicy::uniform(Duration::from_secs(10)));
        cache.set("u1", &day(1), 1, Some(Duration::from_secs(1))).unwrap();
        cache.set("u1", &day(2), 2, None).unwrap();
        cache.set("u2", &day(1), 3, Some(Duration::from_secs(1))).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            cache.stats(),
            CacheStats {
                total: 3,
                valid: 1,
                expired: 2
            }
        );

        assert_eq!(cache.cleanup(), 2);
        assert_eq!(
            cache.stats(),
            CacheStats {
                total: 1,
                valid: 1,
                expired: 0
            }
        );
    }

    #[tokio::test]
    async fn test_invalidate_kind_and_clear_owner() {
        let cache = MemoryCache::new(TtlPolicy::default());
        cache.set("u1", &day(1), 1, None).unwrap();
        cache.set("u1", &day(2), 2, None).unwrap();
        cache.set("u1", &CacheKey::new("profiles"), 3, None).unwrap();
        cache.set("u2", &day(1), 4, None).unwrap();

        assert_eq!(cache.invalidate_kind("u1", "nutrition_logs"), 2);
        assert!(cache.has("u1", &CacheKey::new("profiles")));
        assert!(cache.has("u2", &day(1)));

        assert_eq!(cache.clear_owner("u1"), 1);
        assert_eq!(cache.stats().total, 1);
        assert!(!cache.remove("u1", &day(1)));
        assert!(cache.remove("u2", &day(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let cache = Arc::new(MemoryCache::new(TtlPolicy::uniform(Duration::from_secs(10))));
        cache.set("u1", &CacheKey::new("meals"), 1, None).unwrap();

        let handle = cache.spawn_cleanup(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(cache.stats().total, 0);
        handle.shutdown().await;
    }

    #[test]
    fn test_rejects_owner_with_separator() {
        let cache = MemoryCache::new(TtlPolicy::uniform(Duration::from_secs(60)));
        let key = CacheKey::new("meals");

        assert!(cache.set("u1:meals", &key, 1, None).is_err());
        assert!(cache.set("", &key, 1, None).is_err());
        assert_eq!(cache.stats().total, 0);

        cache.set("u1", &key, 2, None).unwrap();
        assert_eq!(cache.get("u1:meals", &key), None);
        assert!(!cache.remove("u1:meals", &key));
        assert_eq!(cache.get("u1", &key), Some(2));
    }
}
