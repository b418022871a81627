//! # Timeout Guard
//!
//! Bounds how long any remote call may take.
//!
//! ```text
//!   future ──┐
//!            ├── tokio::time::timeout ──► Ok(value) | Err(inner error)
//!   deadline ┘                        └─► Err(SyncError::Timeout)
//! ```
//!
//! On expiry the inner future is dropped; a late result is never observed.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{SyncError, SyncResult};

/// Deadline for queue remote calls unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for remote queries unless configured otherwise.
pub const REMOTE_QUERY_TIMEOUT: Duration = Duration::from_secs(8);

/// Races `future` against `deadline`.
///
/// ## Errors
/// * `SyncError::Timeout` - the deadline elapsed first
/// * the inner future's own error, converted into `SyncError`
pub async fn with_timeout<T, E, F>(deadline: Duration, operation: &str, future: F) -> SyncResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SyncError>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            let after_ms = deadline.as_millis() as u64;
            warn!(operation = %operation, after_ms, "Remote call timed out");
            Err(SyncError::Timeout {
                operation: operation.to_string(),
                after_ms,
            })
        }
    }
}

/// [`with_timeout`] with [`REMOTE_QUERY_TIMEOUT`].
pub async fn with_remote_timeout<T, E, F>(operation: &str, future: F) -> SyncResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SyncError>,
{
    with_timeout(REMOTE_QUERY_TIMEOUT, operation, future).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;

    #[tokio::test(start_paused = true)]
    async fn test_settles_before_deadline() {
        let value = with_timeout(Duration::from_secs(1), "fast", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, RemoteError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let err = with_timeout(Duration::from_millis(500), "select meals", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, RemoteError>(())
        })
        .await
        .unwrap_err();

        match err {
            SyncError::Timeout {
                ref operation,
                after_ms,
            } => {
                assert_eq!(operation, "select meals");
                assert_eq!(after_ms, 500);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let err = with_remote_timeout("delete meals", async {
            Err::<(), _>(RemoteError::failure("connection reset"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Remote(RemoteError::Failure(_))));
    }
}
