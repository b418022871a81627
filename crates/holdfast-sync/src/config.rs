//! # Engine Configuration
//!
//! Configuration management for the offline engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HOLDFAST_DB_PATH=/data/holdfast.db                                 │
//! │     HOLDFAST_QUEUE_MAX_RETRIES=5                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/holdfast/engine.toml (Linux)                             │
//! │     ~/Library/Application Support/com.holdfast.holdfast/engine.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # engine.toml
//! [queue]
//! max_retries = 5
//! remote_timeout_ms = 10000
//!
//! [cache]
//! default_ttl_secs = 300
//! cleanup_interval_secs = 300
//! retention_days = 7
//! prunable_kinds = ["nutrition_logs", "hydration_logs"]
//!
//! [cache.kind_ttl_secs]
//! profiles = 600
//! meals = 120
//!
//! [runner]
//! max_concurrent = 3
//! retry_base_ms = 1000
//!
//! [batcher]
//! window_ms = 50
//! max_batch_size = 10
//!
//! [store]
//! path = "/var/lib/holdfast/holdfast.db"
//! quota_bytes = 5000000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Queue Settings
// =============================================================================

/// Sync Queue behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Failed attempts after which an operation is dropped.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    /// Deadline for each remote call made while draining (milliseconds).
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_ms: u64,
}

fn default_queue_max_retries() -> u32 {
    5
}

fn default_remote_timeout() -> u64 {
    10_000
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_retries: default_queue_max_retries(),
            remote_timeout_ms: default_remote_timeout(),
        }
    }
}

impl QueueSettings {
    /// Remote call deadline.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Memory and durable cache behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Memory-tier TTL for kinds without an override (seconds).
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// Per-kind memory-tier TTL overrides (seconds).
    #[serde(default = "default_kind_ttls")]
    pub kind_ttl_secs: BTreeMap<String, u64>,

    /// Interval of the memory-tier expiry sweep (seconds).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Durable entries of prunable kinds older than this are evicted under
    /// storage pressure (days).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Kinds whose durable entries may be evicted for space.
    #[serde(default = "default_prunable_kinds")]
    pub prunable_kinds: Vec<String>,
}

fn default_ttl() -> u64 {
    300
}

fn default_kind_ttls() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("profiles".to_string(), 600),
        ("macro_goals".to_string(), 600),
        ("meals".to_string(), 120),
    ])
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    7
}

fn default_prunable_kinds() -> Vec<String> {
    vec!["nutrition_logs".to_string(), "hydration_logs".to_string()]
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            default_ttl_secs: default_ttl(),
            kind_ttl_secs: default_kind_ttls(),
            cleanup_interval_secs: default_cleanup_interval(),
            retention_days: default_retention_days(),
            prunable_kinds: default_prunable_kinds(),
        }
    }
}

impl CacheSettings {
    /// Memory-tier TTL for a kind.
    pub fn ttl_for(&self, kind: &str) -> Duration {
        let secs = self
            .kind_ttl_secs
            .get(kind)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }

    /// Memory-tier sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Durable-tier retention window.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

// =============================================================================
// Runner Settings
// =============================================================================

/// Background Task Runner behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Tasks run concurrently per pass.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Delay before the first retry (milliseconds). Doubles per retry.
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    /// Upper bound on any single retry delay (seconds).
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,

    /// Pause between passes while tasks remain (milliseconds).
    #[serde(default = "default_pass_pause")]
    pub pass_pause_ms: u64,

    /// Retry budget for tasks that do not set one.
    #[serde(default = "default_task_max_retries")]
    pub default_max_retries: u32,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_retry_base() -> u64 {
    1000
}

fn default_max_retry_delay() -> u64 {
    3600
}

fn default_pass_pause() -> u64 {
    100
}

fn default_task_max_retries() -> u32 {
    3
}

impl Default for RunnerSettings {
    fn default() -> Self {
        RunnerSettings {
            max_concurrent: default_max_concurrent(),
            retry_base_ms: default_retry_base(),
            max_retry_delay_secs: default_max_retry_delay(),
            pass_pause_ms: default_pass_pause(),
            default_max_retries: default_task_max_retries(),
        }
    }
}

impl RunnerSettings {
    /// Delay before the first retry.
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    /// Retry delay cap.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    /// Pause between passes.
    pub fn pass_pause(&self) -> Duration {
        Duration::from_millis(self.pass_pause_ms)
    }
}

// =============================================================================
// Batcher Settings
// =============================================================================

/// Request Batcher behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatcherSettings {
    /// Collection window, fixed from the first addition (milliseconds).
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Batch size that triggers immediate execution.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Deadline for batched remote queries (milliseconds).
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Capacity of the command channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_window() -> u64 {
    50
}

fn default_max_batch_size() -> usize {
    10
}

fn default_query_timeout() -> u64 {
    8000
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for BatcherSettings {
    fn default() -> Self {
        BatcherSettings {
            window_ms: default_window(),
            max_batch_size: default_max_batch_size(),
            query_timeout_ms: default_query_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BatcherSettings {
    /// Collection window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Batched query deadline.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Durable store location and limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Database file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Byte quota for the store. Unlimited when absent.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sync Queue settings.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Task runner settings.
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Request batcher settings.
    #[serde(default)]
    pub batcher: BatcherSettings,

    /// Durable store settings.
    #[serde(default)]
    pub store: StoreSettings,
}

impl EngineConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (engine.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let positive = [
            ("queue.max_retries", self.queue.max_retries as u64),
            ("queue.remote_timeout_ms", self.queue.remote_timeout_ms),
            ("cache.default_ttl_secs", self.cache.default_ttl_secs),
            ("cache.cleanup_interval_secs", self.cache.cleanup_interval_secs),
            ("cache.retention_days", self.cache.retention_days as u64),
            ("runner.max_concurrent", self.runner.max_concurrent as u64),
            ("runner.max_retry_delay_secs", self.runner.max_retry_delay_secs),
            ("batcher.window_ms", self.batcher.window_ms),
            ("batcher.max_batch_size", self.batcher.max_batch_size as u64),
            ("batcher.query_timeout_ms", self.batcher.query_timeout_ms),
            ("batcher.channel_capacity", self.batcher.channel_capacity as u64),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.store.quota_bytes == Some(0) {
            return Err(SyncError::InvalidConfig(
                "store.quota_bytes must be greater than 0 when set".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HOLDFAST_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.store.path = Some(PathBuf::from(path));
        }

        if let Some(quota) = env_number::<u64>("HOLDFAST_STORE_QUOTA_BYTES") {
            self.store.quota_bytes = Some(quota);
        }

        if let Some(retries) = env_number::<u32>("HOLDFAST_QUEUE_MAX_RETRIES") {
            self.queue.max_retries = retries;
        }

        if let Some(ms) = env_number::<u64>("HOLDFAST_REMOTE_TIMEOUT_MS") {
            debug!(timeout_ms = ms, "Overriding remote timeout from environment");
            self.queue.remote_timeout_ms = ms;
        }

        if let Some(n) = env_number::<usize>("HOLDFAST_RUNNER_MAX_CONCURRENT") {
            self.runner.max_concurrent = n;
        }

        if let Some(ms) = env_number::<u64>("HOLDFAST_BATCH_WINDOW_MS") {
            self.batcher.window_ms = ms;
        }

        if let Some(n) = env_number::<usize>("HOLDFAST_BATCH_MAX_SIZE") {
            self.batcher.max_batch_size = n;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "holdfast", "holdfast")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Database file path: the configured one, else the platform data dir,
    /// else the working directory.
    pub fn database_path(&self) -> PathBuf {
        if let Some(ref path) = self.store.path {
            return path.clone();
        }

        directories::ProjectDirs::from("com", "holdfast", "holdfast")
            .map(|dirs| dirs.data_dir().join("holdfast.db"))
            .unwrap_or_else(|| PathBuf::from("holdfast.db"))
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.remote_timeout(), Duration::from_secs(10));
        assert_eq!(config.runner.max_concurrent, 3);
        assert_eq!(config.batcher.window(), Duration::from_millis(50));
        assert_eq!(config.batcher.max_batch_size, 10);
        assert_eq!(config.cache.retention(), chrono::Duration::days(7));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kind_ttls() {
        let cache = CacheSettings::default();
        assert_eq!(cache.ttl_for("profiles"), Duration::from_secs(600));
        assert_eq!(cache.ttl_for("macro_goals"), Duration::from_secs(600));
        assert_eq!(cache.ttl_for("meals"), Duration::from_secs(120));
        assert_eq!(cache.ttl_for("weight_logs"), Duration::from_secs(300));
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();

        config.batcher.max_batch_size = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.batcher.max_batch_size = 10;
        config.queue.max_retries = 0;
        assert!(config.validate().is_err());

        config.queue.max_retries = 5;
        config.store.quota_bytes = Some(0);
        assert!(config.validate().is_err());

        config.store.quota_bytes = Some(1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [queue]
            max_retries = 2

            [cache.kind_ttl_secs]
            meals = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.queue.remote_timeout_ms, 10_000);
        assert_eq!(config.cache.ttl_for("meals"), Duration::from_secs(30));
        assert_eq!(config.cache.ttl_for("profiles"), Duration::from_secs(300));
        assert_eq!(config.batcher.max_batch_size, 10);
    }

    #[test]
    fn test_toml_serialization() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[queue]"));
        assert!(toml_str.contains("[batcher]"));

        let back: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_explicit_database_path() {
        let mut config = EngineConfig::default();
        config.store.path = Some(PathBuf::from("/tmp/holdfast-test.db"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/holdfast-test.db"));
    }
}
