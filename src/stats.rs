//! Per-worker operation statistics
//!
//! Each worker owns one [`SynchronizedStatistics`] and is its only writer;
//! an external observer snapshots it periodically. The mutex guards only the
//! snapshot moment, so contention is negligible.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::values::Operation;

/// Counters for a single operation kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub requests: u64,
    pub errors: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

impl RequestStats {
    pub fn mean_latency(&self) -> Option<Duration> {
        let samples = self.requests + self.errors;
        if samples == 0 {
            None
        } else {
            Some(self.total_latency / samples as u32)
        }
    }

    fn merge(&mut self, other: &RequestStats) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.total_latency += other.total_latency;
        self.max_latency = self.max_latency.max(other.max_latency);
    }
}

#[derive(Clone, Debug)]
struct Statistics {
    per_op: [RequestStats; Operation::ALL.len()],
    interval_start: Instant,
}

impl Statistics {
    fn new() -> Self {
        Statistics {
            per_op: Default::default(),
            interval_start: Instant::now(),
        }
    }

    fn register(&mut self, latency: Duration, operation: Operation, error: bool) {
        let slot = &mut self.per_op[operation.index()];
        if error {
            slot.errors += 1;
        } else {
            slot.requests += 1;
        }
        slot.total_latency += latency;
        slot.max_latency = slot.max_latency.max(latency);
    }
}

/// Immutable view of a statistics interval.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    per_op: [RequestStats; Operation::ALL.len()],
    /// Wall-clock span the counters cover.
    pub interval: Duration,
}

impl StatsSnapshot {
    pub fn empty() -> Self {
        StatsSnapshot {
            per_op: Default::default(),
            interval: Duration::ZERO,
        }
    }

    pub fn operation(&self, operation: Operation) -> &RequestStats {
        &self.per_op[operation.index()]
    }

    pub fn requests(&self, operation: Operation) -> u64 {
        self.operation(operation).requests
    }

    pub fn errors(&self, operation: Operation) -> u64 {
        self.operation(operation).errors
    }

    pub fn total_requests(&self) -> u64 {
        self.per_op.iter().map(|s| s.requests).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.per_op.iter().map(|s| s.errors).sum()
    }

    /// Combine with a snapshot from another worker. Intervals are joined by
    /// taking the maximum, since workers run concurrently.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        for op in Operation::ALL {
            self.per_op[op.index()].merge(other.operation(op));
        }
        self.interval = self.interval.max(other.interval);
    }
}

/// Statistics with a snapshot-safe critical section.
#[derive(Debug)]
pub struct SynchronizedStatistics {
    inner: Mutex<Statistics>,
}

impl Default for SynchronizedStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl SynchronizedStatistics {
    pub fn new() -> Self {
        SynchronizedStatistics {
            inner: Mutex::new(Statistics::new()),
        }
    }

    pub fn register_request(&self, latency: Duration, operation: Operation) {
        self.inner.lock().register(latency, operation, false);
    }

    pub fn register_error(&self, latency: Duration, operation: Operation) {
        self.inner.lock().register(latency, operation, true);
    }

    /// Atomically read the counters, optionally starting a fresh interval.
    pub fn snapshot(&self, reset: bool) -> StatsSnapshot {
        let mut inner = self.inner.lock();
        let snapshot = StatsSnapshot {
            per_op: inner.per_op,
            interval: inner.interval_start.elapsed(),
        };
        if reset {
            *inner = Statistics::new();
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_snapshot() {
        let stats = SynchronizedStatistics::new();
        stats.register_request(Duration::from_micros(10), Operation::Put);
        stats.register_request(Duration::from_micros(30), Operation::Put);
        stats.register_error(Duration::from_micros(5), Operation::Get);

        let snap = stats.snapshot(false);
        assert_eq!(snap.requests(Operation::Put), 2);
        assert_eq!(snap.errors(Operation::Put), 0);
        assert_eq!(snap.errors(Operation::Get), 1);
        assert_eq!(
            snap.operation(Operation::Put).mean_latency(),
            Some(Duration::from_micros(20))
        );
        assert_eq!(snap.operation(Operation::Put).max_latency, Duration::from_micros(30));
    }

    #[test]
    fn test_snapshot_reset_starts_fresh_interval() {
        let stats = SynchronizedStatistics::new();
        stats.register_request(Duration::from_micros(1), Operation::Remove);

        let first = stats.snapshot(true);
        assert_eq!(first.requests(Operation::Remove), 1);

        let second = stats.snapshot(false);
        assert_eq!(second.requests(Operation::Remove), 0);
        assert_eq!(second.total_requests(), 0);
    }

    #[test]
    fn test_merge_combines_workers() {
        let a = SynchronizedStatistics::new();
        let b = SynchronizedStatistics::new();
        a.register_request(Duration::from_micros(10), Operation::Put);
        b.register_request(Duration::from_micros(20), Operation::Put);
        b.register_error(Duration::from_micros(2), Operation::Remove);

        let mut merged = a.snapshot(false);
        merged.merge(&b.snapshot(false));
        assert_eq!(merged.requests(Operation::Put), 2);
        assert_eq!(merged.errors(Operation::Remove), 1);
    }

    #[test]
    fn test_mean_latency_empty() {
        assert_eq!(RequestStats::default().mean_latency(), None);
    }
}
