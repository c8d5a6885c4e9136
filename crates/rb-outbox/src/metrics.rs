//! Dispatcher counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared monotonic counters, incremented across the pipeline.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub items_polled: AtomicU64,
    pub items_succeeded: AtomicU64,
    pub items_failed: AtomicU64,
    pub items_recovered: AtomicU64,
    pub buffer_rejected: AtomicU64,
}

/// Point-in-time view of the counters plus pipeline gauges.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items_polled: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub items_recovered: u64,
    pub buffer_rejected: u64,
    pub in_flight: u64,
    pub active_groups: usize,
}

impl DispatcherMetrics {
    pub fn snapshot(&self, in_flight: u64, active_groups: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            items_polled: self.items_polled.load(Ordering::Relaxed),
            items_succeeded: self.items_succeeded.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            items_recovered: self.items_recovered.load(Ordering::Relaxed),
            buffer_rejected: self.buffer_rejected.load(Ordering::Relaxed),
            in_flight,
            active_groups,
        }
    }
}

/// Saturating decrement for the advisory in-flight counter. It resets to
/// zero on restart, so an underflow would otherwise wrap and wedge the
/// poller's capacity check.
pub(crate) fn sub_in_flight(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        Some(current.saturating_sub(n))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_in_flight_saturates_at_zero() {
        let counter = AtomicU64::new(3);
        sub_in_flight(&counter, 10);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn snapshot_reads_counters() {
        let metrics = DispatcherMetrics::default();
        metrics.items_polled.store(7, Ordering::Relaxed);
        metrics.items_succeeded.store(5, Ordering::Relaxed);

        let snapshot = metrics.snapshot(2, 1);
        assert_eq!(snapshot.items_polled, 7);
        assert_eq!(snapshot.items_succeeded, 5);
        assert_eq!(snapshot.in_flight, 2);
        assert_eq!(snapshot.active_groups, 1);
    }
}
