//! # holdfast-store: Durable Storage Primitive
//!
//! The device-local persistent store shared by the Sync Queue and the
//! Durable Cache. It uses SQLite via sqlx and exposes namespaced
//! key-value rows with an optional byte quota.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   SyncQueue ──────────┐                 ┌────────── DurableCache        │
//! │   queue:{owner}       │                 │   cache:{owner}:{key}         │
//! │                       ▼                 ▼                               │
//! │              ┌─────────────────────────────────┐                        │
//! │              │  ★ holdfast-store (THIS CRATE) ★ │                        │
//! │              │                                 │                        │
//! │              │  Store ─► KvRepository          │                        │
//! │              │  quota check, prefix scans      │                        │
//! │              └────────────────┬────────────────┘                        │
//! │                               ▼                                         │
//! │                     SQLite (WAL) kv_entries                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`namespace`] - Queue/cache key prefixes
//! - [`error`] - Storage error types
//! - [`repository`] - Key-value repository
//!
//! ## Usage
//!
//! ```rust,ignore
//! use holdfast_store::{Namespace, Store, StoreConfig};
//!
//! let store = Store::new(StoreConfig::new("holdfast.db").quota_bytes(5_000_000)).await?;
//! let key = Namespace::Cache.key("user-1", "profiles");
//! store.entries().put(&key, r#"{"data":{}}"#).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod namespace;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use namespace::Namespace;
pub use pool::{Store, StoreConfig};
pub use repository::kv::{KvEntry, KvRepository, StorageUsage};
