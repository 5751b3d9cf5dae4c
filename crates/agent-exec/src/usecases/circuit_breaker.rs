//! Process-wide circuit breaker guarding hook invocations.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::common::mutex_lock_or_recover;
use crate::domain::CircuitBreakerState;
use crate::domain::CircuitState;
use crate::usecases::ports::ClockHandle;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Leave to make one guarded call, settled with [`Self::succeeded`] or
/// [`Self::failed`].
///
/// Each permit carries the breaker generation it was issued under; a result
/// from an earlier generation (a call admitted before the breaker tripped,
/// closed or was reset) is ignored. Dropping an unsettled trial permit frees
/// the half-open slot without changing state.
#[must_use = "settle the permit with succeeded() or failed()"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this call is the single half-open probe.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, true);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, false);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial(self.generation);
        }
    }
}

struct CircuitBreakerInner {
    state: CircuitBreakerState,
    trial_in_flight: bool,
    generation: u64,
}

/// `closed → open` after `failure_threshold` consecutive failures,
/// `open → half_open` once the cool-down elapses, then one probe decides
/// between `closed` and `open` again.
///
/// All transitions happen under one mutex so concurrent sessions observe a
/// consistent state.
pub struct CircuitBreaker {
    inner: Mutex<CircuitBreakerInner>,
    config: BreakerConfig,
    clock: ClockHandle,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: ClockHandle) -> Self {
        Self {
            inner: Mutex::new(CircuitBreakerInner {
                state: CircuitBreakerState::closed(),
                trial_in_flight: false,
                generation: 0,
            }),
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                cooldown: config.cooldown,
            },
            clock,
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// `None` while the breaker is open or a half-open probe is in flight.
    pub fn admit(self: &Arc<Self>) -> Option<BreakerPermit> {
        let mut inner = mutex_lock_or_recover(&self.inner);
        let trial = match inner.state.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .state
                    .opened_at
                    .is_none_or(|opened| self.clock.elapsed(opened) >= self.config.cooldown);
                if !cooled {
                    return None;
                }
                inner.state.state = CircuitState::HalfOpen;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                true
            }
        };
        if trial {
            inner.trial_in_flight = true;
        }
        Some(BreakerPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    fn settle(&self, generation: u64, trial: bool, ok: bool) {
        let mut inner = mutex_lock_or_recover(&self.inner);
        if inner.generation != generation {
            return;
        }
        match inner.state.state {
            CircuitState::Closed if ok => inner.state.consecutive_failures = 0,
            CircuitState::Closed => {
                inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);
                if inner.state.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen if trial && ok => {
                inner.state = CircuitBreakerState::closed();
                inner.trial_in_flight = false;
                inner.generation += 1;
            }
            CircuitState::HalfOpen if trial => {
                inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);
                self.trip(&mut inner);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut CircuitBreakerInner) {
        inner.state.state = CircuitState::Open;
        inner.state.opened_at = Some(self.clock.now());
        inner.trial_in_flight = false;
        inner.generation += 1;
    }

    fn abandon_trial(&self, generation: u64) {
        let mut inner = mutex_lock_or_recover(&self.inner);
        if inner.generation == generation && inner.state.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        mutex_lock_or_recover(&self.inner).state.state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        mutex_lock_or_recover(&self.inner).state
    }

    /// Milliseconds since the breaker last opened, if it is not closed.
    pub fn opened_ms_ago(&self) -> Option<u64> {
        let opened = self.snapshot().opened_at?;
        Some(self.clock.elapsed_ms(opened))
    }

    pub fn reset(&self) {
        let mut inner = mutex_lock_or_recover(&self.inner);
        inner.state = CircuitBreakerState::closed();
        inner.trial_in_flight = false;
        inner.generation += 1;
    }
}
