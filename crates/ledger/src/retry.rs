//! Caller-side retry for optimistic ledger operations.
//!
//! The ledger reports a lost compare-and-swap as `ConcurrentModification`
//! and leaves the decision to retry with the caller. Callers that want the
//! usual bounded exponential backoff wrap the operation in
//! [`retry_on_conflict`].

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::{LedgerError, Result};

/// Bounded exponential backoff.
///
/// Defaults: 5 retries, 10 ms initial delay doubling up to 200 ms.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (zero-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self
            .initial_delay
            .mul_f64(self.multiplier.powi(exponent).min(f64::from(u32::MAX)));
        delay.min(self.max_delay)
    }
}

/// Runs `operation`, retrying on `ConcurrentModification` only.
///
/// Any other error is returned immediately. Once retries are exhausted the
/// last conflict is returned.
pub async fn retry_on_conflict<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "ledger operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying after conflict");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if let LedgerError::ConcurrentModification { .. } = err {
                    tracing::warn!(attempts = attempt + 1, error = %err, "conflict retries exhausted");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use common::{CabinTypeId, VoyageId};

    use super::*;
    use crate::{InventoryKey, Version};

    fn conflict() -> LedgerError {
        LedgerError::ConcurrentModification {
            key: InventoryKey::new(VoyageId::new(), CabinTypeId::new()),
            expected: Version::initial(),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::default().with_initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_on_conflict(&fast(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_on_conflict(&fast().with_max_retries(2), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_on_conflict(&fast(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::InvalidQuantity(0))
            }
        })
        .await;

        assert!(matches!(result, Err(LedgerError::InvalidQuantity(0))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
