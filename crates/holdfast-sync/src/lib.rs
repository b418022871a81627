//! # holdfast-sync: Offline Sync and Caching Engine
//!
//! Keeps an app's reads answering and its writes durable while the remote
//! data service is slow, unreachable, or rate-limited, and reconciles once it
//! comes back.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      OfflineEngine (orchestrator)                       │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Reads                                                           │  │
//! │  │  MemoryCache ─► DurableCache ─► RequestBatcher ─► RemoteStore    │  │
//! │  │   (TTL)          (envelopes,      (window +         (trait)      │  │
//! │  │                   retention)       max size)                     │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Writes                                                          │  │
//! │  │  OptimisticCoordinator ─► SyncQueue ─► TaskRunner ─► drain       │  │
//! │  │   (confirm/rollback)      (durable     (priority,     │          │  │
//! │  │                            per owner)   backoff)      ▼          │  │
//! │  │                                           Timeout Guard ─► remote │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  SyncQueue and DurableCache share one holdfast-store, split by         │
//! │  key namespace ("queue:" / "cache:").                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Components
//! - [`queue`] - Durable per-owner write queue and drain
//! - [`memory_cache`] - Process-lifetime TTL cache
//! - [`durable_cache`] - Store-backed cache with quota-driven pruning
//! - [`runner`] - Priority task runner with retry backoff
//! - [`batcher`] - Windowed request batching
//! - [`optimistic`] - Optimistic update confirm/rollback
//! - [`engine`] - `OfflineEngine` wiring all of the above
//!
//! ### Plumbing
//! - [`config`] - Engine configuration (file, env, defaults)
//! - [`error`] - Engine error types
//! - [`events`] - Sync event emitter
//! - [`remote`] - Remote data service trait and an in-memory implementation
//! - [`timeout`] - Deadline guard for remote calls
//!
//! ## Usage
//!
//! ```rust,ignore
//! use holdfast_sync::{EngineConfig, OfflineEngine};
//! use holdfast_core::{CacheKey, SyncAction, SyncOperationDraft};
//!
//! let config = EngineConfig::load_or_default(None);
//! let engine = OfflineEngine::builder(config)
//!     .with_remote(remote)
//!     .build()
//!     .await?;
//! engine.start();
//!
//! // Read through the tiers
//! let profile = engine
//!     .read("user-1", &CacheKey::new("profiles"), SelectQuery::new("profiles").eq("id", "user-1"))
//!     .await?;
//! println!("from {:?}", profile.source);
//!
//! // Queue a write; it syncs in the background
//! engine
//!     .write("user-1", SyncOperationDraft::new(SyncAction::Insert, "meals", "m-1", payload))
//!     .await?;
//!
//! // On reconnect
//! let report = engine.sync_owner("user-1").await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Plumbing
pub mod config;
pub mod error;
pub mod events;
pub mod remote;
pub mod timeout;

// Components
pub mod batcher;
pub mod durable_cache;
pub mod memory_cache;
pub mod optimistic;
pub mod queue;
pub mod runner;

// Orchestrator
pub mod engine;

// =============================================================================
// Re-exports
// =============================================================================

pub use batcher::{BatchOperation, BatchResult, BatcherHandle, RequestBatcher};
pub use config::{
    BatcherSettings, CacheSettings, EngineConfig, QueueSettings, RunnerSettings, StoreSettings,
};
pub use durable_cache::{CacheEnvelope, DurableCache};
pub use engine::{CacheResult, CacheSource, OfflineEngine, OfflineEngineBuilder};
pub use error::{RemoteError, RemoteResult, SyncError, SyncResult};
pub use events::{DrainReport, NoOpEmitter, SyncEventEmitter};
pub use memory_cache::{CacheStats, CleanupHandle, MemoryCache, TtlPolicy};
pub use optimistic::{OptimisticCoordinator, OptimisticUpdate, PendingUpdate};
pub use queue::SyncQueue;
pub use remote::{InMemoryRemote, RemoteCall, RemoteMethod, RemoteStore, SelectQuery};
pub use runner::{BackgroundTask, RunnerStatus, TaskRunner};
pub use timeout::{with_remote_timeout, with_timeout};
