//! Clock Port
//!
//! Rate windows and idle eviction run on monotonic time; timestamps shown to
//! clients run on wall time. Tests drive both through `ManualClock`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of wall and monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant for elapsed/timeout comparisons.
    fn monotonic_now(&self) -> Instant;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// A clock frozen at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_utc: Utc::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward by `by`. Clones share the same offset.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let offset = self.elapsed();
        self.base_utc + chrono::Duration::from_std(offset).unwrap_or(chrono::TimeDelta::MAX)
    }

    fn monotonic_now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }
}
