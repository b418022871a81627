//! # holdfast-core: Pure Types for the Offline Engine
//!
//! This crate holds the data model that every other Holdfast crate speaks.
//! It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Holdfast Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Application / UI layer                       │   │
//! │  │      typed, validated records ──► SyncOperationDraft            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 holdfast-sync (engine)                          │   │
//! │  │   SyncQueue, caches, runner, batcher, optimistic coordinator    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ holdfast-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────┐  ┌────────────┐  ┌──────────┐  ┌───────────┐  │   │
//! │  │   │ operation  │  │ cache_key  │  │  clock   │  │validation │  │   │
//! │  │   │SyncOperation│ │ CacheKey   │  │ Clock    │  │  rules    │  │   │
//! │  │   └────────────┘  └────────────┘  └──────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] - `SyncOperation`, its draft form, and `SyncAction`
//! - [`cache_key`] - `(kind, optional date bucket)` cache addressing
//! - [`clock`] - Wall-clock abstraction (system + manual)
//! - [`error`] - Domain error types
//! - [`validation`] - Owner, kind, and record id rules
//!
//! ## Example Usage
//!
//! ```rust
//! use holdfast_core::{SyncAction, SyncOperationDraft};
//! use serde_json::json;
//!
//! let draft = SyncOperationDraft::from_record(
//!     SyncAction::Insert,
//!     "meals",
//!     "meal-1",
//!     &json!({ "id": "meal-1", "calories": 420 }),
//! )
//! .unwrap();
//!
//! assert_eq!(draft.action, SyncAction::Insert);
//! assert!(draft.validate().is_ok());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache_key;
pub mod clock;
pub mod error;
pub mod operation;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cache_key::CacheKey;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult, ValidationError};
pub use operation::{Payload, SyncAction, SyncOperation, SyncOperationDraft};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Separator between the segments of every storage and cache key.
///
/// Owners, kinds, and record ids are validated to never contain it, so a
/// prefix scan on `queue:{owner}` can never pick up another owner's data.
pub const KEY_SEPARATOR: char = ':';

/// Maximum length of an entity kind name.
pub const MAX_KIND_LEN: usize = 64;

/// Maximum length of an owner or record identifier.
pub const MAX_ID_LEN: usize = 128;
