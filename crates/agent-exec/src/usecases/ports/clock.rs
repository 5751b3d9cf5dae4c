use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn elapsed(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }

    fn elapsed_ms(&self, start: Instant) -> u64 {
        u64::try_from(self.elapsed(start).as_millis()).unwrap_or(u64::MAX)
    }
}

pub type ClockHandle = Arc<dyn Clock>;
