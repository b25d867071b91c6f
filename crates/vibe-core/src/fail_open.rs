//! Fail-open utilities for graceful degradation
//!
//! For infrastructure work whose failure must never surface to the caller:
//! temp-file cleanup, best-effort notifications, stats snapshots.
//!
//! DO NOT use fail-open for:
//! - Applying or reversing patch operations
//! - Appending to the audit event log
//! - Protocol replies a client is waiting on

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use vibe_core::fail_open::fail_open;
/// use vibe_core::Result;
///
/// async fn remove_scratch_file() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let cleaned = fail_open("scratch_cleanup", || remove_scratch_file()).await;
///     assert!(cleaned.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
