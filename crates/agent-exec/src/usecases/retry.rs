//! Shared retry-with-backoff policy for transient failures.

use std::time::Duration;

use rand::Rng;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);
// Jitter for exponential backoff (0-30% of delay)
const DEFAULT_JITTER: f64 = 0.30;

/// Exponential backoff with jitter.
///
/// Used by every call site that touches a flaky collaborator (history store
/// reads and writes, hook spawns) so backoff behavior is tuned in one place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    #[cfg(test)]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[cfg(test)]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponential = self.base_delay.saturating_mul(1u32 << retry.min(4));
        let jitter_range = exponential.mul_f64(self.jitter);
        let jitter = if jitter_range.is_zero() {
            Duration::ZERO
        } else {
            let micros = u64::try_from(jitter_range.as_micros()).unwrap_or(u64::MAX);
            Duration::from_micros(rand::rng().random_range(0..=micros))
        };
        exponential.saturating_add(jitter).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Blocks the calling thread between attempts; async callers use the
    /// runtime-aware runner in `infra::retry`.
    pub fn run_blocking<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.max_attempts && is_transient(&err) => {
                    std::thread::sleep(self.delay_for(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10))
            .with_jitter(0.0)
            .with_max_delay(Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for(9), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_thirty_percent() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        for _ in 0..50 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(130));
        }
    }

    #[test]
    fn test_run_blocking_retries_transient_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<u32, &str> = policy.run_blocking(
            |attempt| {
                calls += 1;
                if attempt < 2 { Err("busy") } else { Ok(attempt) }
            },
            |_| true,
        );
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_run_blocking_stops_on_permanent_error() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<(), &str> = policy.run_blocking(
            |_| {
                calls += 1;
                Err("missing")
            },
            |err| *err != "missing",
        );
        assert_eq!(result, Err("missing"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_none_policy_makes_single_attempt() {
        let policy = RetryPolicy::none();
        let mut calls = 0;
        let _: Result<(), ()> = policy.run_blocking(
            |_| {
                calls += 1;
                Err(())
            },
            |_| true,
        );
        assert_eq!(calls, 1);
    }
}
