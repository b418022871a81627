//! # Error Types
//!
//! Domain-specific error types for holdfast-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  holdfast-core errors (this file)                                      │
//! │  ├── CoreError        - Draft/record conversion failures               │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  holdfast-store errors (separate crate)                                │
//! │  └── DbError          - Storage failures, quota exhaustion             │
//! │                                                                         │
//! │  holdfast-sync errors (separate crate)                                 │
//! │  └── SyncError        - Remote, timeout, config, channel failures      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while building operations from application records.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The record did not serialize to a JSON object.
    ///
    /// ## When This Occurs
    /// - A scalar or array was passed where a row was expected
    /// - A custom `Serialize` impl emits something other than a map
    #[error("Payload for {entity_kind} must be an object, got {found}")]
    PayloadNotObject { entity_kind: String, found: String },

    /// The record could not be serialized at all.
    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., forbidden separator in an identifier).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Insert and update operations need at least one field.
    #[error("{action} on {entity_kind} requires a non-empty payload")]
    EmptyPayload { action: String, entity_kind: String },
}

impl ValidationError {
    /// Creates a Required error for the given field.
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
