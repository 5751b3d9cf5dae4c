use std::time::Instant;

use sysinfo::System;

use crate::usecases::ports::Clock;
use crate::usecases::ports::SystemLoad;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One-minute load average from `sysinfo`; `None` where the platform reports zeros.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoLoad;

impl SystemLoad for SysinfoLoad {
    fn load_average(&self) -> Option<f64> {
        let load = System::load_average();
        (load.one.is_finite() && load.one > 0.0).then_some(load.one)
    }
}
