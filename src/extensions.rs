use std::time::{Instant, SystemTime};

/// Time source shared by circuit breakers and the request executor.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn now_system(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}
