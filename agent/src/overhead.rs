//! Running-mean cost of the profiler's own flush and setup work

use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverheadCounter {
    total_us: i64,
    count: i64,
}

impl OverheadCounter {
    pub fn add_sample(&mut self, duration_us: i64) {
        self.total_us += duration_us;
        self.count += 1;
    }

    /// Mean sample in microseconds; 0 before any sample
    pub fn mean_us(&self) -> i64 {
        if self.count == 0 {
            return 0;
        }
        self.total_us / self.count
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    /// Run `f` and record its wall time as one sample
    pub fn measure<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let result = f();
        self.add_sample(started.elapsed().as_micros() as i64);
        result
    }
}

/// Counters reported with each trace. Not reset between traces.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverheadAccounting {
    pub flush: OverheadCounter,
    pub setup: OverheadCounter,
}

impl OverheadAccounting {
    pub const FLUSH: &'static str = "flush";
    pub const SETUP: &'static str = "setup";

    pub fn entries(&self) -> [(&'static str, i64); 2] {
        [(Self::FLUSH, self.flush.mean_us()), (Self::SETUP, self.setup.mean_us())]
    }
}
