//! Uniform retry policy for outbound calls.
//!
//! Every remote boundary (webhook, collaborator queries, cluster API,
//! persistence) goes through the same bounded attempt loop instead of
//! ad hoc error swallowing at each call site.

use crate::GuardianError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with fixed backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
    /// Per-request timeout, applied by the caller's client.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
            timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            timeout,
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted. The last error
    /// is surfaced unchanged.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, GuardianError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GuardianError>>,
    {
        let mut last_err = GuardianError::Connectivity(format!("{}: no attempts made", op_name));
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        op_name, attempt, self.max_attempts, e
                    );
                    last_err = e;
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("op", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(GuardianError::Connectivity("transient".into()))
                } else {
                    Ok(42u32)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_and_surfaces_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GuardianError::Connectivity("down".into()))
            })
            .await;

        assert!(matches!(result, Err(GuardianError::Connectivity(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_secs(1));
        let result = policy.run("op", || async { Ok::<_, GuardianError>(1u8) }).await;
        assert_eq!(result.unwrap(), 1);
    }
}
