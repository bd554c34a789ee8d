use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of the current time, injected into volumes, writers and the sync loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

pub fn system() -> SharedClock { Arc::new(SystemClock) }

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> { Arc::new(Self { now: Mutex::new(start) }) }

    pub fn set(&self, t: DateTime<Utc>) { *self.now.lock() = t; }

    pub fn add(&self, d: Duration) { let mut g = self.now.lock(); *g = *g + d; }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> { *self.now.lock() }
}
