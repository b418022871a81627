//! # Cache Keys
//!
//! Cache entries are addressed by `(owner, kind, optional date bucket)`.
//! The owner is supplied at call time; a [`CacheKey`] carries the rest.
//!
//! ```text
//! CacheKey::new("profiles")                      → "profiles"
//! CacheKey::for_date("nutrition_logs", 2024-03-09) → "nutrition_logs:2024-03-09"
//!
//! memory tier:  "{owner}:{key}"
//! durable tier: "cache:{owner}:{key}"
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::validation::{validate_entity_kind, ValidationResult};
use crate::KEY_SEPARATOR;

/// Date format used for date buckets.
pub const DATE_BUCKET_FORMAT: &str = "%Y-%m-%d";

/// The non-owner part of a cache address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Entity kind the cached value belongs to.
    pub kind: String,
    /// Optional per-day bucket.
    pub date: Option<NaiveDate>,
}

impl CacheKey {
    /// Key for an undated value of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        CacheKey {
            kind: kind.into(),
            date: None,
        }
    }

    /// Key for one day's bucket of the given kind.
    pub fn for_date(kind: impl Into<String>, date: NaiveDate) -> Self {
        CacheKey {
            kind: kind.into(),
            date: Some(date),
        }
    }

    /// Validates the kind segment.
    pub fn validate(&self) -> ValidationResult<()> {
        validate_entity_kind(&self.kind)
    }

    /// Parses the owner-relative form produced by `Display`.
    ///
    /// Returns `None` for anything that is not `kind` or `kind:YYYY-MM-DD`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(2, KEY_SEPARATOR);
        let kind = parts.next().filter(|k| !k.is_empty())?;

        match parts.next() {
            None => Some(CacheKey::new(kind)),
            Some(date) => NaiveDate::parse_from_str(date, DATE_BUCKET_FORMAT)
                .ok()
                .map(|d| CacheKey::for_date(kind, d)),
        }
    }

    /// Key used by the in-memory tier.
    pub fn memory_key(&self, owner: &str) -> String {
        format!("{}{}{}", owner, KEY_SEPARATOR, self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => write!(
                f,
                "{}{}{}",
                self.kind,
                KEY_SEPARATOR,
                date.format(DATE_BUCKET_FORMAT)
            ),
            None => write!(f, "{}", self.kind),
        }
    }
}
