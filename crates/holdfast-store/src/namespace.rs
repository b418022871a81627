//! # Key Namespaces
//!
//! The Sync Queue and the Durable Cache share one table. A fixed prefix per
//! namespace keeps their write sets disjoint.
//!
//! ```text
//! queue:{owner}             ← Sync Queue log (never evicted for space)
//! cache:{owner}:{key}       ← Durable Cache envelope (prunable)
//! ```

use holdfast_core::KEY_SEPARATOR;
use std::fmt;

/// A partition of the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Per-owner pending-write logs.
    Queue,
    /// Per-owner cache envelopes.
    Cache,
}

impl Namespace {
    /// The fixed prefix for this namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Queue => "queue",
            Namespace::Cache => "cache",
        }
    }

    /// Prefix covering every key of one owner in this namespace.
    ///
    /// For the queue this is also the full key of the owner's log.
    pub fn owner_prefix(&self, owner: &str) -> String {
        format!("{}{}{}", self.prefix(), KEY_SEPARATOR, owner)
    }

    /// Prefix for scanning an owner's suffixed keys.
    ///
    /// Ends in the separator, so owner `u1` never matches `u10`.
    pub fn scan_prefix(&self, owner: &str) -> String {
        format!("{}{}", self.owner_prefix(owner), KEY_SEPARATOR)
    }

    /// Prefix covering the whole namespace.
    pub fn root_prefix(&self) -> String {
        format!("{}{}", self.prefix(), KEY_SEPARATOR)
    }

    /// Full key for an owner-relative suffix.
    pub fn key(&self, owner: &str, suffix: &str) -> String {
        format!("{}{}{}", self.owner_prefix(owner), KEY_SEPARATOR, suffix)
    }

    /// Splits a full key into `(owner, suffix)` if it belongs to this namespace.
    ///
    /// The suffix is empty for queue keys.
    pub fn split<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = key
            .strip_prefix(self.prefix())?
            .strip_prefix(KEY_SEPARATOR)?;

        match rest.split_once(KEY_SEPARATOR) {
            Some((owner, suffix)) => Some((owner, suffix)),
            None => Some((rest, "")),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
