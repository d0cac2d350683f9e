//! Timers behind the coordinator's debounce window, pacing waits and `Retry-After` holds.
//!
//! Swapping the [`Sleeper`] lets tests see which delays were scheduled without changing
//! dispatch behaviour.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of the coordinator's timers.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Timers on the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Records every scheduled delay, then waits it out on the tokio clock.
///
/// A timer that fired immediately would make the coordinator re-check pacing in a busy loop,
/// so the wait is real; pair it with a paused runtime to keep tests instant.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    scheduled: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay scheduled so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.scheduled().clone()
    }

    pub fn max_call(&self) -> Option<Duration> {
        self.scheduled().iter().copied().max()
    }

    pub fn clear(&self) {
        self.scheduled().clear();
    }

    fn scheduled(&self) -> std::sync::MutexGuard<'_, Vec<Duration>> {
        self.scheduled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.scheduled().push(duration);
        tokio::time::sleep(duration).boxed()
    }
}
