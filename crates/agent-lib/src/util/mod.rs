//! Concurrency helpers shared by the reconciliation loops
//!
//! - [`with_timeout`] bounds every backend and store call
//! - [`RetryPolicy`] retries idempotent operations with exponential backoff
//! - [`KeyedLock`] is a fail-fast, per-key "in flight" marker
//! - [`WorkerPool`] bounds fan-out of per-workload work

mod lock;
mod pool;
mod retry;

pub use lock::{KeyedLock, KeyedLockGuard};
pub use pool::{PoolError, WorkerPool};
pub use retry::RetryPolicy;

use crate::error::{AgentError, Result};
use std::future::Future;
use std::time::Duration;

/// Run `fut` with a deadline.
///
/// On expiry the future is dropped, which aborts the in-flight call rather
/// than leaving it running in the background.
pub async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout { op, timeout }),
    }
}
