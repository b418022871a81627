//! # Sync Error Types
//!
//! Error types for the engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │       Storage           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Remote(..)     │  │  Storage                │ │
//! │  │  ConfigLoad     │  │  Timeout        │  │  QuotaExceeded          │ │
//! │  │  ConfigSave     │  │                 │  │  CorruptRecord          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │      Input      │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  Validation     │  │  ShuttingDown   │                              │
//! │  │  Serialization  │  │  ChannelError   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! │                                                                         │
//! │  Remote signals (RemoteError):                                         │
//! │  DuplicateKey / NotFound  → idempotent outcomes, never retried         │
//! │  Failure                  → transient, retried                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use holdfast_core::{CoreError, ValidationError};
use holdfast_store::DbError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type alias for calls into the remote service.
pub type RemoteResult<T> = Result<T, RemoteError>;

// =============================================================================
// Remote Error
// =============================================================================

/// Structured error returned by the remote data service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The row (or its conflict key) already exists.
    #[error("Duplicate key in {entity_kind}: {record_id}")]
    DuplicateKey {
        entity_kind: String,
        record_id: String,
    },

    /// The row does not exist.
    #[error("{entity_kind} not found: {record_id}")]
    NotFound {
        entity_kind: String,
        record_id: String,
    },

    /// Anything else: network, rate limit, server error.
    #[error("Remote failure: {0}")]
    Failure(String),
}

impl RemoteError {
    /// Creates a generic failure.
    pub fn failure(message: impl Into<String>) -> Self {
        RemoteError::Failure(message.into())
    }

    /// Returns true for a duplicate-key signal.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, RemoteError::DuplicateKey { .. })
    }

    /// Returns true for a not-found signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Engine error type.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote service answered with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A guarded call did not settle before its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The durable store is out of space.
    #[error("Storage quota exceeded: write needs {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// Any other storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Failed to serialize or deserialize a value.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// A background task failed without a more specific error.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// The component is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::QuotaExceeded {
                requested,
                available,
            } => SyncError::QuotaExceeded {
                requested,
                available,
            },
            other => SyncError::Storage(other.to_string()),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::Validation(v.to_string()),
            other => SyncError::SerializationFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Remote failures (network, rate limit, server error)
    /// - Timeouts
    ///
    /// ## Non-Retryable Errors
    /// - Idempotent remote signals (duplicate key, not found)
    /// - Configuration, validation, and storage errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Remote(RemoteError::Failure(_)) | SyncError::Timeout { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error came from the durable store.
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            SyncError::QuotaExceeded { .. }
                | SyncError::Storage(_)
                | SyncError::CorruptRecord { .. }
        )
    }

    /// Returns the remote signal, if this is a remote error.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(e) => Some(e),
            _ => None,
        }
    }
}
