//! Runtime-aware runner for the shared `RetryPolicy`.

use std::fmt::Display;
use std::future::Future;

use tracing::debug;

use crate::usecases::RetryPolicy;

/// Like `RetryPolicy::run_blocking`, but sleeps on the tokio timer so a
/// backoff never parks a runtime worker.
pub async fn retry_async<T, E, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut(u32) -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < policy.max_attempts() && is_transient(&err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let result: Result<u32, String> = retry_async(
            &policy,
            "test",
            |_| true,
            |attempt| std::future::ready(if attempt < 3 { Err("busy".to_string()) } else { Ok(attempt) }),
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<(), String> = retry_async(&policy, "test", |_| true, |_| {
            calls += 1;
            std::future::ready(Err("busy".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
