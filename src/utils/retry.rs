//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Order submission is
//! retried only on duplicate-key collisions, with a fresh order id per
//! attempt.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::storage::StorageError;

/// Backoff for order submission retries (duplicate-key collisions).
///
/// - Min delay: 10ms
/// - Max delay: 500ms
/// - Max attempts: 3
/// - Jitter enabled
pub fn submit_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Determines if a storage error is retryable.
///
/// Retryable:
/// - `DuplicateKey`: two submissions raced on a generated id; a retry with a
///   fresh id can succeed.
///
/// Non-retryable:
/// - `VersionConflict`: the client's snapshot is stale. Retrying with the
///   same version number will never succeed.
/// - Everything else (connection failures, malformed rows).
pub fn is_retryable_storage(err: &StorageError) -> bool {
    matches!(err, StorageError::DuplicateKey { .. })
}
