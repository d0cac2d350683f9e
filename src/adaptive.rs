//! Live settings shared between the coordinator and application code.
//!
//! The dispatch loop reads a snapshot on every cycle while setters (and the throttle ratchet)
//! replace it. Readers never block; a snapshot stays valid after a later update.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Lock-free handle to a value that changes while requests are in flight.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    current: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { current: Arc::clone(&self.current) }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(value)) }
    }

    pub fn get(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Derive the next value from the current one and return the value it replaced.
    ///
    /// `derive` may run more than once when updates race; the last run wins and none is lost.
    pub fn update<F>(&self, derive: F) -> Arc<T>
    where
        F: Fn(&T) -> T,
    {
        self.current.rcu(|current| Arc::new(derive(current)))
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use crate::config::Settings;
    use std::thread;

    #[test]
    fn update_returns_previous_snapshot() {
        let settings = DynamicConfig::new(Settings::default());
        let before = settings.get();
        let previous = settings.update(|s| Settings { max_active_requests: 1, ..s.clone() });
        assert_eq!(previous.max_active_requests, before.max_active_requests);
        assert_eq!(settings.get().max_active_requests, 1);
        assert_eq!(before.max_active_requests, 6, "old snapshots are unaffected");
    }

    #[test]
    fn racing_updates_are_not_lost() {
        let counter = DynamicConfig::new(0usize);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        counter.update(|n| n + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.get(), 400);
    }
}
