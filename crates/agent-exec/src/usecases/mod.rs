pub mod circuit_breaker;
pub mod ports;
pub mod retry;
pub mod timeout_estimator;

pub use circuit_breaker::BreakerConfig;
pub use circuit_breaker::CircuitBreaker;
pub use retry::RetryPolicy;
pub use timeout_estimator::EstimatorConfig;
pub use timeout_estimator::FallbackReason;
pub use timeout_estimator::Prediction;
pub use timeout_estimator::PredictionSource;
pub use timeout_estimator::TimeoutEstimator;
