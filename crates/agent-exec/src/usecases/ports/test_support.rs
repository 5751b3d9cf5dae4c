//! Test doubles for usecase ports.

use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use super::Clock;
use super::HistoryError;
use super::HistoryStore;
use super::SystemLoad;
use crate::domain::CommandSignature;
use crate::domain::TimeoutSample;

pub struct FakeClock {
    now: Mutex<Instant>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

/// Store whose every call fails, counting attempts.
pub struct UnreachableHistoryStore {
    pub calls: AtomicUsize,
}

impl UnreachableHistoryStore {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HistoryStore for UnreachableHistoryStore {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    fn get(&self, _signature: &CommandSignature) -> Result<Vec<TimeoutSample>, HistoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HistoryError::Unavailable {
            reason: "connection refused".to_string(),
        })
    }

    fn append(&self, _sample: &TimeoutSample) -> Result<(), HistoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HistoryError::Unavailable {
            reason: "connection refused".to_string(),
        })
    }
}

pub struct FixedLoad(pub Option<f64>);

impl SystemLoad for FixedLoad {
    fn load_average(&self) -> Option<f64> {
        self.0
    }
}
