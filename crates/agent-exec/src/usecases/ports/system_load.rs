use std::sync::Arc;

/// Host load probe consulted when scaling history-based predictions.
pub trait SystemLoad: Send + Sync {
    /// One-minute load average, if the platform reports one.
    fn load_average(&self) -> Option<f64>;
}

pub type SystemLoadHandle = Arc<dyn SystemLoad>;
