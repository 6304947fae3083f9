//! Receiver for traffic events emitted by running services

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Cumulative counters reported by one service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_conns: u64,
    pub current_conns: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub total_errs: u64,
}

/// Callback invoked with every accepted update
pub type UpdateCallback = Arc<dyn Fn(&str, ServiceStats) + Send + Sync>;

/// Keeps the latest cumulative counters per service and republishes them
#[derive(Default)]
pub struct StatsObserver {
    services: DashMap<String, ServiceStats>,
    on_update: RwLock<Option<UpdateCallback>>,
}

impl std::fmt::Debug for StatsObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsObserver")
            .field("services", &self.services.len())
            .field("has_callback", &self.on_update.read().is_some())
            .finish()
    }
}

impl StatsObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_update(&self, callback: UpdateCallback) {
        *self.on_update.write() = Some(callback);
    }

    /// Accept one cumulative update; updates without a service name are
    /// ignored
    pub fn observe_one(&self, service: &str, stats: ServiceStats) {
        if service.is_empty() {
            return;
        }
        trace!(
            service,
            input = stats.input_bytes,
            output = stats.output_bytes,
            "stats event"
        );

        // Map guard is dropped before the callback runs
        self.services.insert(service.to_string(), stats);

        let callback = self.on_update.read().clone();
        if let Some(callback) = callback {
            callback(service, stats);
        }
    }

    #[must_use]
    pub fn get_stats(&self, service: &str) -> ServiceStats {
        self.services
            .get(service)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_all_stats(&self) -> Vec<(String, ServiceStats)> {
        self.services
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn reset_stats(&self, service: &str) {
        if let Some(mut stats) = self.services.get_mut(service) {
            *stats = ServiceStats::default();
        }
    }

    pub fn reset_all_stats(&self) {
        for mut entry in self.services.iter_mut() {
            *entry.value_mut() = ServiceStats::default();
        }
    }

    /// Forget a service entirely
    pub fn remove_stats(&self, service: &str) {
        self.services.remove(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn sample(input: u64) -> ServiceStats {
        ServiceStats {
            total_conns: 1,
            current_conns: 0,
            input_bytes: input,
            output_bytes: input * 2,
            total_errs: 0,
        }
    }

    #[test]
    fn test_observe_stores_latest_and_calls_back() {
        let observer = StatsObserver::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        observer.set_on_update(Arc::new(move |_, stats| {
            seen_cb.store(stats.input_bytes, Ordering::SeqCst);
        }));

        observer.observe_one("svc", sample(10));
        observer.observe_one("svc", sample(25));
        observer.observe_one("", sample(99));

        assert_eq!(observer.get_stats("svc").input_bytes, 25);
        assert_eq!(seen.load(Ordering::SeqCst), 25);
        assert_eq!(observer.get_all_stats().len(), 1);
    }

    #[test]
    fn test_callback_may_reenter_observer() {
        let observer = Arc::new(StatsObserver::new());
        let inner = Arc::clone(&observer);
        observer.set_on_update(Arc::new(move |service, _| {
            let _ = inner.get_stats(service);
        }));
        observer.observe_one("svc", sample(1));
    }

    #[test]
    fn test_reset_and_remove() {
        let observer = StatsObserver::new();
        observer.observe_one("a", sample(5));
        observer.observe_one("b", sample(7));

        observer.reset_stats("a");
        assert_eq!(observer.get_stats("a"), ServiceStats::default());
        assert_eq!(observer.get_stats("b").input_bytes, 7);

        observer.reset_all_stats();
        assert_eq!(observer.get_stats("b"), ServiceStats::default());

        observer.remove_stats("a");
        assert_eq!(observer.get_all_stats().len(), 1);
    }
}
