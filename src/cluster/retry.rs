//! Named retry policies for membership operations.
//!
//! Every bounded retry loop in the crate uses one of these policies so that
//! backoff and jitter are consistent and retry exhaustion is observable.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `cas_policy_with_attempts` | 10ms | 1s | attempts - 1 | Read-modify-CAS after a conflict |
//! | `store_policy` | 20ms | 500ms | 3 | Transient store reads |
//! | `saga_policy_with_tries` | 100ms | 5s | tries - 1 | Whole-saga restarts |
//!
//! # Example
//!
//! ```rust,no_run
//! use membrane::cluster::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::store_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!     Ok(result)
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Policy for CAS conflicts bounded to `attempts` total tries.
///
/// Short delays: a conflict means somebody else just wrote, so the fresh
/// state is already readable.
pub fn cas_policy_with_attempts(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}

/// Policy for transient store failures.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for whole-saga restarts bounded to `tries` total runs.
pub fn saga_policy_with_tries(tries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(tries.saturating_sub(1))
        .with_jitter()
}

/// Run `operation` under [`store_policy`] while `condition` holds.
pub async fn with_store_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(store_policy()).when(condition).await
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: usize) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a retry success.
pub fn record_retry_success(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}
