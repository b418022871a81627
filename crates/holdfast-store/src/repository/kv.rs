//! # Key-Value Repository
//!
//! Row-level access to `kv_entries` with byte-quota enforcement.
//!
//! ## Quota Check
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         put(key, value)                                 │
//! │                                                                         │
//! │  new_size = len(key) + len(value)                                      │
//! │  old_size = size_bytes of existing row (0 if absent)                   │
//! │                                                                         │
//! │  new_size <= old_size ?  ── yes ──►  write (shrinking never fails)     │
//! │         │ no                                                            │
//! │         ▼                                                               │
//! │  used_by_others = SUM(size_bytes) - old_size                           │
//! │  used_by_others + new_size > quota ? ── yes ──► QuotaExceeded          │
//! │         │ no                                                            │
//! │         ▼                                                               │
//! │  write                                                                  │
//! │                                                                         │
//! │  Check and write run in one transaction.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};

/// One stored row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct KvEntry {
    /// Full namespaced key.
    pub key: String,
    /// Stored text (JSON by convention).
    pub value: String,
    /// `len(key) + len(value)`.
    pub size_bytes: i64,
    /// Time of the last put.
    pub updated_at: DateTime<Utc>,
}

/// Storage consumption snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    /// Bytes currently stored.
    pub used_bytes: u64,
    /// Configured quota, if any.
    pub quota_bytes: Option<u64>,
    /// Number of rows.
    pub entries: u64,
}

impl StorageUsage {
    /// Bytes still available under the quota, `None` when unlimited.
    pub fn available_bytes(&self) -> Option<u64> {
        self.quota_bytes
            .map(|quota| quota.saturating_sub(self.used_bytes))
    }
}

/// Repository for namespaced key-value rows.
#[derive(Debug, Clone)]
pub struct KvRepository {
    pool: SqlitePool,
    quota_bytes: Option<u64>,
}

impl KvRepository {
    /// Creates a new KvRepository.
    pub fn new(pool: SqlitePool, quota_bytes: Option<u64>) -> Self {
        KvRepository { pool, quota_bytes }
    }

    /// Returns the stored value for `key`.
    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Returns the full row for `key`.
    pub async fn get_entry(&self, key: &str) -> DbResult<Option<KvEntry>> {
        let entry = sqlx::query_as::<_, KvEntry>(
            r#"
            SELECT key, value, size_bytes, updated_at
            FROM kv_entries
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Inserts or replaces `key`.
    ///
    /// ## Errors
    /// * `DbError::QuotaExceeded` - the write would grow the store past its quota
    pub async fn put(&self, key: &str, value: &str) -> DbResult<()> {
        let size = (key.len() + value.len()) as u64;
        let mut tx = self.pool.begin().await?;

        if let Some(quota) = self.quota_bytes {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT size_bytes FROM kv_entries WHERE key = ?1")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await?;
            let existing = existing.unwrap_or(0).max(0) as u64;

            if size > existing {
                let total: i64 =
                    sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM kv_entries")
                        .fetch_one(&mut *tx)
                        .await?;
                let used_by_others = (total.max(0) as u64).saturating_sub(existing);

                if used_by_others + size > quota {
                    warn!(
                        key = %key,
                        requested = size,
                        used = used_by_others,
                        quota,
                        "Write rejected by storage quota"
                    );
                    return Err(DbError::QuotaExceeded {
                        requested: size,
                        available: quota.saturating_sub(used_by_others),
                    });
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, size_bytes, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                size_bytes = excluded.size_bytes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(size as i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(key = %key, size_bytes = size, "Stored entry");
        Ok(())
    }

    /// Removes `key`. Returns true if a row was deleted.
    pub async fn remove(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns every row whose key starts with `prefix`, ordered by key.
    pub async fn scan_prefix(&self, prefix: &str) -> DbResult<Vec<KvEntry>> {
        let entries = sqlx::query_as::<_, KvEntry>(
            r#"
            SELECT key, value, size_bytes, updated_at
            FROM kv_entries
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key ASC
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Counts rows whose key starts with `prefix`.
    pub async fn count_prefix(&self, prefix: &str) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1",
        )
        .bind(prefix)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    /// Removes every row whose key starts with `prefix`. Returns the count.
    pub async fn remove_prefix(&self, prefix: &str) -> DbResult<u64> {
        let result =
            sqlx::query("DELETE FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1")
                .bind(prefix)
                .execute(&self.pool)
                .await?;

        debug!(prefix = %prefix, removed = result.rows_affected(), "Removed prefix");
        Ok(result.rows_affected())
    }

    /// Returns bytes used, the quota, and the row count.
    pub async fn usage(&self) -> DbResult<StorageUsage> {
        let (used, entries): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(size_bytes), 0), COUNT(*) FROM kv_entries",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageUsage {
            used_bytes: used.max(0) as u64,
            quota_bytes: self.quota_bytes,
            entries: entries.max(0) as u64,
        })
    }
}
