//! Time source for pacing decisions and `Retry-After` dates.

use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since an arbitrary origin; never decreases.
    fn now_millis(&self) -> u64;

    /// Wall-clock time, used to turn an HTTP-date `Retry-After` into a wait.
    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn elapsed_since(&self, start_ms: u64) -> Duration {
        Duration::from_millis(self.now_millis().saturating_sub(start_ms))
    }
}

/// Clock on `tokio::time::Instant`, so a paused test runtime drives it with
/// `tokio::time::advance`. Wall time is the wall time at construction plus elapsed
/// monotonic time, which keeps both readings consistent under a paused clock.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
    wall_start: SystemTime,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now(), wall_start: SystemTime::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn wall_time(&self) -> SystemTime {
        self.wall_start + self.start.elapsed()
    }
}
