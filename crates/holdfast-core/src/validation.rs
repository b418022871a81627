//! # Validation Module
//!
//! Identifier rules for everything that ends up inside a storage key.
//!
//! ## Why Identifiers Are Checked Here
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Key Namespace Layout                               │
//! │                                                                         │
//! │  queue:{owner}                       ← one durable log per owner        │
//! │  cache:{owner}:{kind}                ← undated cache entry              │
//! │  cache:{owner}:{kind}:{YYYY-MM-DD}   ← date-bucketed cache entry        │
//! │                                                                         │
//! │  A ':' inside an owner or kind would let `queue:alice` match           │
//! │  `queue:alice:evil`, so both are rejected before any key is built.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Record payloads are validated by the application layer that owns their
//! schema; this module only checks the envelope.

use crate::error::ValidationError;
use crate::{KEY_SEPARATOR, MAX_ID_LEN, MAX_KIND_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates an owner identifier.
///
/// ## Rules
/// - Must not be empty or whitespace
/// - At most 128 characters
/// - Must not contain the key separator `:`
///
/// ## Example
/// ```rust
/// use holdfast_core::validation::validate_owner;
///
/// assert!(validate_owner("user-42").is_ok());
/// assert!(validate_owner("").is_err());
/// assert!(validate_owner("a:b").is_err());
/// ```
pub fn validate_owner(owner: &str) -> ValidationResult<()> {
    validate_identifier("owner", owner, MAX_ID_LEN)
}

/// Validates an entity kind (remote collection name).
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Only ASCII letters, digits, `_` and `-`
///
/// ## Example
/// ```rust
/// use holdfast_core::validation::validate_entity_kind;
///
/// assert!(validate_entity_kind("nutrition_logs").is_ok());
/// assert!(validate_entity_kind("meals:2024").is_err());
/// ```
pub fn validate_entity_kind(kind: &str) -> ValidationResult<()> {
    validate_identifier("entity_kind", kind, MAX_KIND_LEN)?;

    if !kind
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidFormat {
            field: "entity_kind".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates a record identifier.
pub fn validate_record_id(record_id: &str) -> ValidationResult<()> {
    validate_identifier("record_id", record_id, MAX_ID_LEN)
}

fn validate_identifier(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::required(field));
    }

    if value.len() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    if value.contains(KEY_SEPARATOR) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("must not contain '{}'", KEY_SEPARATOR),
        });
    }

    Ok(())
}
