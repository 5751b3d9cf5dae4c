//! History-driven timeout prediction with a static fallback table.

use std::time::Duration;

use serde::Serialize;

use crate::domain::CommandSignature;
use crate::domain::CommandSpec;
use crate::domain::Complexity;
use crate::domain::TimeoutSample;
use crate::domain::signature::classify;
use crate::domain::signature::signature_for;
use crate::usecases::ports::HistoryError;
use crate::usecases::ports::HistoryStoreHandle;
use crate::usecases::ports::SystemLoadHandle;
use crate::usecases::retry::RetryPolicy;

/// Timeouts keyed by complexity when no usable history exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackTable {
    pub trivial: Duration,
    pub simple: Duration,
    pub medium: Duration,
    pub complex: Duration,
    pub extreme: Duration,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self {
            trivial: Duration::from_secs(30),
            simple: Duration::from_secs(90),
            medium: Duration::from_secs(300),
            complex: Duration::from_secs(900),
            extreme: Duration::from_secs(1800),
        }
    }
}

impl FallbackTable {
    pub fn for_complexity(&self, complexity: Complexity) -> Duration {
        match complexity {
            Complexity::Trivial => self.trivial,
            Complexity::Simple => self.simple,
            Complexity::Medium => self.medium,
            Complexity::Complex => self.complex,
            Complexity::Extreme => self.extreme,
        }
    }

    /// Smallest and largest table entries.
    #[cfg(test)]
    pub fn bounds(&self) -> (Duration, Duration) {
        let entries = [
            self.trivial,
            self.simple,
            self.medium,
            self.complex,
            self.extreme,
        ];
        let min = entries.iter().copied().min().unwrap_or(self.medium);
        let max = entries.iter().copied().max().unwrap_or(self.medium);
        (min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorConfig {
    /// Successful samples required before history is trusted.
    pub min_samples: usize,
    /// Most recent successful samples considered.
    pub window: usize,
    pub percentile: f64,
    pub safety_factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// One-minute load average above which history predictions are scaled.
    pub load_threshold: f64,
    pub load_multiplier: f64,
    pub fallback: FallbackTable,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            window: 20,
            percentile: 0.9,
            safety_factor: 1.5,
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(2 * 60 * 60),
            load_threshold: 14.0,
            load_multiplier: 3.0,
            fallback: FallbackTable::default(),
        }
    }
}

impl EstimatorConfig {
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !(self.percentile.is_finite() && self.percentile > 0.0 && self.percentile <= 1.0) {
            self.percentile = defaults.percentile;
        }
        if !(self.safety_factor.is_finite() && self.safety_factor > 0.0) {
            self.safety_factor = defaults.safety_factor;
        }
        if !(self.load_multiplier.is_finite() && self.load_multiplier >= 1.0) {
            self.load_multiplier = defaults.load_multiplier;
        }
        self.min_samples = self.min_samples.max(1);
        self.window = self.window.max(self.min_samples);
        if self.max_timeout < self.min_timeout {
            self.max_timeout = self.min_timeout;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    InsufficientHistory { samples: usize },
    StoreUnavailable { error: String },
    StoreTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PredictionSource {
    /// Timeout supplied by the client.
    Requested,
    History {
        samples: usize,
        load_adjusted: bool,
    },
    Fallback {
        complexity: Complexity,
        reason: FallbackReason,
    },
}

impl PredictionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSource::Requested => "requested",
            PredictionSource::History { .. } => "history",
            PredictionSource::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub signature: CommandSignature,
    pub timeout: Duration,
    pub source: PredictionSource,
}

impl Prediction {
    /// The store was consulted but could not answer.
    pub fn store_degraded(&self) -> Option<&FallbackReason> {
        match &self.source {
            PredictionSource::Fallback {
                reason: reason @ (FallbackReason::StoreUnavailable { .. } | FallbackReason::StoreTimeout),
                ..
            } => Some(reason),
            _ => None,
        }
    }
}

/// Predicts a deadline from recent durations of similarly-shaped commands.
///
/// With at least `min_samples` successful samples the prediction is the
/// configured percentile of the most recent `window` samples times the
/// safety factor; otherwise the complexity table answers. Store failures
/// never escape `predict`.
pub struct TimeoutEstimator {
    store: HistoryStoreHandle,
    load: Option<SystemLoadHandle>,
    retry: RetryPolicy,
    config: EstimatorConfig,
}

impl TimeoutEstimator {
    pub fn new(store: HistoryStoreHandle, config: EstimatorConfig) -> Self {
        Self {
            store,
            load: None,
            retry: RetryPolicy::default(),
            config: config.sanitized(),
        }
    }

    pub fn with_load(mut self, load: SystemLoadHandle) -> Self {
        self.load = Some(load);
        self
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn signature(&self, spec: &CommandSpec) -> CommandSignature {
        signature_for(spec)
    }

    pub fn predict(&self, spec: &CommandSpec) -> Prediction {
        let signature = signature_for(spec);
        let samples = match self
            .retry
            .run_blocking(|_| self.store.get(&signature), HistoryError::is_transient)
        {
            Ok(samples) => samples,
            Err(err) => {
                return self.fallback_with(
                    spec,
                    signature,
                    FallbackReason::StoreUnavailable {
                        error: err.to_string(),
                    },
                );
            }
        };

        let mut recent: Vec<Duration> = samples
            .iter()
            .rev()
            .filter(|sample| sample.success)
            .take(self.config.window)
            .map(TimeoutSample::observed_duration)
            .collect();

        if recent.len() < self.config.min_samples {
            let count = recent.len();
            return self.fallback_with(
                spec,
                signature,
                FallbackReason::InsufficientHistory { samples: count },
            );
        }

        let Some(base) = percentile(&mut recent, self.config.percentile) else {
            return self.fallback_with(
                spec,
                signature,
                FallbackReason::InsufficientHistory { samples: 0 },
            );
        };
        let mut timeout = scale(base, self.config.safety_factor, self.config.max_timeout);
        let load_adjusted = self
            .load
            .as_ref()
            .and_then(|probe| probe.load_average())
            .is_some_and(|avg| avg > self.config.load_threshold);
        if load_adjusted {
            timeout = scale(timeout, self.config.load_multiplier, self.config.max_timeout);
        }

        Prediction {
            signature,
            timeout: self.clamp(timeout),
            source: PredictionSource::History {
                samples: recent.len(),
                load_adjusted,
            },
        }
    }

    /// Static-table prediction, used directly when the store is too slow.
    pub fn fallback(&self, spec: &CommandSpec, reason: FallbackReason) -> Prediction {
        self.fallback_with(spec, signature_for(spec), reason)
    }

    pub fn requested(&self, spec: &CommandSpec, timeout: Duration) -> Prediction {
        Prediction {
            signature: signature_for(spec),
            timeout,
            source: PredictionSource::Requested,
        }
    }

    /// Appends one observation. Callers treat failures as best-effort.
    pub fn record(
        &self,
        signature: CommandSignature,
        observed: Duration,
        success: bool,
    ) -> Result<(), HistoryError> {
        let sample = TimeoutSample::new(signature, observed, success);
        self.retry
            .run_blocking(|_| self.store.append(&sample), HistoryError::is_transient)
    }

    fn fallback_with(
        &self,
        spec: &CommandSpec,
        signature: CommandSignature,
        reason: FallbackReason,
    ) -> Prediction {
        let complexity = classify(spec);
        Prediction {
            signature,
            timeout: self.clamp(self.config.fallback.for_complexity(complexity)),
            source: PredictionSource::Fallback { complexity, reason },
        }
    }

    fn clamp(&self, timeout: Duration) -> Duration {
        timeout.clamp(self.config.min_timeout, self.config.max_timeout)
    }
}

/// Nearest-rank percentile; sorts `values` in place.
pub fn percentile(values: &mut [Duration], p: f64) -> Option<Duration> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let rank = (p.clamp(0.0, 1.0) * values.len() as f64).ceil() as usize;
    let index = rank.clamp(1, values.len()) - 1;
    values.get(index).copied()
}

fn scale(value: Duration, factor: f64, ceiling: Duration) -> Duration {
    Duration::try_from_secs_f64(value.as_secs_f64() * factor).unwrap_or(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usecases::ports::HistoryStore;
    use crate::usecases::ports::MemoryHistoryStore;
    use crate::usecases::ports::NullHistoryStore;
    use crate::usecases::ports::test_support::FixedLoad;
    use crate::usecases::ports::test_support::UnreachableHistoryStore;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn claude(prompt: &str) -> CommandSpec {
        CommandSpec::new("claude").arg("-p").arg(prompt)
    }

    fn seeded(spec: &CommandSpec, secs: &[u64]) -> Arc<MemoryHistoryStore> {
        let store = Arc::new(MemoryHistoryStore::default());
        let signature = signature_for(spec);
        for s in secs {
            store
                .append(&TimeoutSample::new(
                    signature.clone(),
                    Duration::from_secs(*s),
                    true,
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let mut values: Vec<Duration> = (1..=10).map(Duration::from_secs).collect();
        assert_eq!(percentile(&mut values, 0.9), Some(Duration::from_secs(9)));
        assert_eq!(percentile(&mut values, 1.0), Some(Duration::from_secs(10)));
        assert_eq!(percentile(&mut values, 0.0), Some(Duration::from_secs(1)));
        assert_eq!(percentile(&mut [], 0.9), None);
    }

    #[test]
    fn test_history_prediction_uses_percentile_and_safety_factor() {
        let spec = claude("write a short poem");
        let store = seeded(&spec, &[10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        let estimator = TimeoutEstimator::new(store, EstimatorConfig::default());

        let prediction = estimator.predict(&spec);
        assert_eq!(prediction.timeout, Duration::from_secs(135));
        assert_eq!(
            prediction.source,
            PredictionSource::History {
                samples: 10,
                load_adjusted: false
            }
        );
    }

    #[test]
    fn test_too_few_samples_falls_back_to_table() {
        let spec = CommandSpec::new("echo").arg("hi");
        let store = seeded(&spec, &[1, 1]);
        let estimator = TimeoutEstimator::new(store, EstimatorConfig::default());

        let prediction = estimator.predict(&spec);
        assert_eq!(prediction.timeout, Duration::from_secs(30));
        assert_eq!(
            prediction.source,
            PredictionSource::Fallback {
                complexity: Complexity::Trivial,
                reason: FallbackReason::InsufficientHistory { samples: 2 },
            }
        );
    }

    #[test]
    fn test_failed_samples_are_ignored() {
        let spec = CommandSpec::new("make").arg("test");
        let store = Arc::new(MemoryHistoryStore::default());
        for _ in 0..5 {
            store
                .append(&TimeoutSample::new(
                    signature_for(&spec),
                    Duration::from_secs(999),
                    false,
                ))
                .unwrap();
        }
        let estimator = TimeoutEstimator::new(store, EstimatorConfig::default());
        assert_eq!(estimator.predict(&spec).source.as_str(), "fallback");
    }

    #[test]
    fn test_unreachable_store_degrades_without_error() {
        let store = Arc::new(UnreachableHistoryStore::new());
        let estimator = TimeoutEstimator::new(store.clone(), EstimatorConfig::default())
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)));

        let prediction = estimator.predict(&claude("Refactor the storage layer"));
        let (min, max) = EstimatorConfig::default().fallback.bounds();
        assert!(prediction.timeout >= min && prediction.timeout <= max);
        assert!(prediction.store_degraded().is_some());
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn test_record_failure_is_reported_not_panicking() {
        let estimator = TimeoutEstimator::new(
            Arc::new(UnreachableHistoryStore::new()),
            EstimatorConfig::default(),
        )
        .with_retry(RetryPolicy::none());
        let result = estimator.record(CommandSignature::new("ls"), Duration::from_secs(1), true);
        assert!(result.is_err());
    }

    #[test]
    fn test_high_load_scales_history_prediction() {
        let spec = CommandSpec::new("pytest");
        let store = seeded(&spec, &[10, 10, 10]);
        let estimator = TimeoutEstimator::new(store, EstimatorConfig::default())
            .with_load(Arc::new(FixedLoad(Some(20.0))));

        let prediction = estimator.predict(&spec);
        assert_eq!(prediction.timeout, Duration::from_secs(45));
        assert!(matches!(
            prediction.source,
            PredictionSource::History {
                load_adjusted: true,
                ..
            }
        ));
    }

    #[test]
    fn test_prediction_is_clamped() {
        let spec = CommandSpec::new("true");
        let store = seeded(&spec, &[0, 0, 0]);
        let estimator = TimeoutEstimator::new(store, EstimatorConfig::default());
        assert_eq!(estimator.predict(&spec).timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_config_is_sanitized() {
        let config = EstimatorConfig {
            percentile: f64::NAN,
            safety_factor: -1.0,
            min_samples: 0,
            ..EstimatorConfig::default()
        };
        let estimator = TimeoutEstimator::new(Arc::new(NullHistoryStore), config);
        assert_eq!(estimator.config().percentile, 0.9);
        assert_eq!(estimator.config().safety_factor, 1.5);
        assert_eq!(estimator.config().min_samples, 1);
    }

    proptest! {
        #[test]
        fn prop_fallback_stays_within_table_bounds(
            argv in proptest::collection::vec("[a-z \\[\\]:0-9./-]{1,24}", 1..6)
        ) {
            let Ok(spec) = CommandSpec::from_argv(argv) else {
                return Ok(());
            };
            let estimator = TimeoutEstimator::new(
                Arc::new(UnreachableHistoryStore::new()),
                EstimatorConfig::default(),
            )
            .with_retry(RetryPolicy::none());
            let prediction = estimator.predict(&spec);
            let (min, max) = EstimatorConfig::default().fallback.bounds();
            prop_assert!(prediction.timeout > Duration::ZERO);
            prop_assert!(prediction.timeout >= min && prediction.timeout <= max);
        }
    }
}
