//! Change notifications emitted by the coordinator.
//!
//! Applications subscribe through [`Coordinator::subscribe`](crate::Coordinator::subscribe) to
//! learn when the coordinator changes its own behaviour, most importantly when it drops the
//! concurrency cap to one because the server is throttling. Events are delivered over a
//! `tokio::sync::broadcast` channel: slow receivers lose the oldest events rather than holding
//! up dispatch.
//!
//! ```rust
//! use fhirbatch::telemetry::{CoordinatorEvent, EventBus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//! bus.emit(CoordinatorEvent::ConcurrencyReduced { max_active_requests: 1 });
//! assert_eq!(rx.recv().await.unwrap(), CoordinatorEvent::ConcurrencyReduced { max_active_requests: 1 });
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Something the coordinator decided on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Throttling forced the concurrency cap down.
    ConcurrencyReduced { max_active_requests: usize },
    /// The inter-request delay changed.
    PacingChanged { min_delay: Duration },
    /// A throttled or failed exchange was put back in the queue.
    Retrying { url: String, attempt: usize, retry_after: Duration },
    /// Retries stopped; the request failed terminally.
    GaveUp { url: String, status: u16 },
    /// Pending and active requests were discarded.
    Cleared { pending: usize, active: usize },
}

impl fmt::Display for CoordinatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorEvent::ConcurrencyReduced { max_active_requests } => {
                write!(f, "ConcurrencyReduced(max_active={})", max_active_requests)
            }
            CoordinatorEvent::PacingChanged { min_delay } => {
                write!(f, "PacingChanged(min_delay={:?})", min_delay)
            }
            CoordinatorEvent::Retrying { url, attempt, retry_after } => {
                write!(f, "Retrying({}, attempt #{}, after {:?})", url, attempt, retry_after)
            }
            CoordinatorEvent::GaveUp { url, status } => write!(f, "GaveUp({}, status={})", url, status),
            CoordinatorEvent::Cleared { pending, active } => {
                write!(f, "Cleared(pending={}, active={})", pending, active)
            }
        }
    }
}

/// Broadcast fan-out of [`CoordinatorEvent`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<CoordinatorEvent>>,
    undelivered: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), undelivered: Arc::new(AtomicU64::new(0)) }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events emitted while nobody was subscribed.
    pub fn undelivered_count(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    /// Best-effort send; never blocks.
    pub fn emit(&self, event: CoordinatorEvent) {
        tracing::debug!(%event, "coordinator event");
        if self.sender.send(event).is_err() {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(CoordinatorEvent::PacingChanged { min_delay: Duration::from_millis(100) });
        bus.emit(CoordinatorEvent::ConcurrencyReduced { max_active_requests: 1 });
        assert_eq!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::PacingChanged { min_delay: Duration::from_millis(100) }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::ConcurrencyReduced { max_active_requests: 1 }
        );
    }

    #[test]
    fn emit_without_subscribers_is_counted() {
        let bus = EventBus::default();
        bus.emit(CoordinatorEvent::Cleared { pending: 2, active: 1 });
        assert_eq!(bus.undelivered_count(), 1);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn display_is_compact() {
        let event = CoordinatorEvent::GaveUp { url: "Patient".into(), status: 429 };
        assert_eq!(event.to_string(), "GaveUp(Patient, status=429)");
    }
}
