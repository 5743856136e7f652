//! Fixed-delay retry for commands against freshly created sandboxes.
//!
//! A new sandbox's hostname can take a while to resolve; only connectivity
//! errors are retried. Any other error, or an exhausted budget, is returned.

use std::future::Future;

use provision_backend::BackendResult;
use tracing::debug;

use crate::config::RetryConfig;

pub async fn retry_transient<T, F, Fut>(policy: &RetryConfig, mut op: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < attempts => {
                debug!(
                    attempt = attempt,
                    attempts = attempts,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision_backend::{BackendError, BackendErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy() -> RetryConfig {
        RetryConfig {
            attempts: 5,
            delay_ms: 5_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connectivity_with_fixed_delay() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let out = retry_transient(&policy(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BackendError::connectivity("exec", "Name or service not known"))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&policy(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BackendError::connectivity("exec", "Connection refused"))
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&policy(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BackendError::new(BackendErrorKind::Timeout, "exec", "timed out"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
