//! Time source shared by the ledger and the response cache
//!
//! Production code uses [`SystemClock`]. Tests drive a [`MockClock`] by hand so TTL
//! expiry, LRU ordering and step durations are deterministic.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of "now"
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock frozen at the Unix epoch
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Set the clock to a specific time
    pub fn set(&self, time: DateTime<Utc>) {
        *self.lock() = time;
    }

    /// Advance the clock by a duration
    pub fn advance(&self, duration: Duration) {
        let mut now = self.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }

    /// Advance the clock by a number of milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A poisoned clock still holds a valid timestamp.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Default shared wall clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Milliseconds elapsed between two instants, clamped at zero
pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
