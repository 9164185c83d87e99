//! Injected clock so loops are testable without sleeping.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Time source for orchestration loops.
///
/// Production code uses [`SystemClock`]; tests advance a manual clock
/// instead of sleeping.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
