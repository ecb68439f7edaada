//! Atomic counters for engine observability.
//!
//! All counters use relaxed ordering: they are diagnostic, not
//! synchronization primitives. One instance lives in each engine.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-engine operation counters.
pub struct EngineMetrics {
    /// Epochs begun (including the first).
    pub epochs: AtomicU64,
    /// Epochs that ended in a commit.
    pub commits: AtomicU64,
    /// Epochs that ended in a rollback.
    pub rollbacks: AtomicU64,
    /// Dirty pages diffed at commit.
    pub dirty_pages: AtomicU64,
    /// Words that differed from their twin and reached persistent memory.
    pub committed_words: AtomicU64,
    /// Canary words inspected at epoch boundaries and on free.
    pub canary_checks: AtomicU64,
    /// Canary words found corrupted.
    pub canary_failures: AtomicU64,
    /// Quarantine entries handed back to the allocator.
    pub quarantine_evictions: AtomicU64,
    /// Writes found in quarantined memory.
    pub uaf_detections: AtomicU64,
    /// Unreachable objects found at program end.
    pub leaks: AtomicU64,
    /// Recorded synchronization events consumed during replay.
    pub replayed_events: AtomicU64,
    /// Threads reaped at epoch begin.
    pub reaped_threads: AtomicU64,
}

impl EngineMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            epochs: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            dirty_pages: AtomicU64::new(0),
            committed_words: AtomicU64::new(0),
            canary_checks: AtomicU64::new(0),
            canary_failures: AtomicU64::new(0),
            quarantine_evictions: AtomicU64::new(0),
            uaf_detections: AtomicU64::new(0),
            leaks: AtomicU64::new(0),
            replayed_events: AtomicU64::new(0),
            reaped_threads: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            epochs: Self::get(&self.epochs),
            commits: Self::get(&self.commits),
            rollbacks: Self::get(&self.rollbacks),
            dirty_pages: Self::get(&self.dirty_pages),
            committed_words: Self::get(&self.committed_words),
            canary_checks: Self::get(&self.canary_checks),
            canary_failures: Self::get(&self.canary_failures),
            quarantine_evictions: Self::get(&self.quarantine_evictions),
            uaf_detections: Self::get(&self.uaf_detections),
            leaks: Self::get(&self.leaks),
            replayed_events: Self::get(&self.replayed_events),
            reaped_threads: Self::get(&self.reaped_threads),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub epochs: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub dirty_pages: u64,
    pub committed_words: u64,
    pub canary_checks: u64,
    pub canary_failures: u64,
    pub quarantine_evictions: u64,
    pub uaf_detections: u64,
    pub leaks: u64,
    pub replayed_events: u64,
    pub reaped_threads: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = EngineMetrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increment_and_add() {
        let m = EngineMetrics::new();
        EngineMetrics::inc(&m.commits);
        EngineMetrics::inc(&m.commits);
        EngineMetrics::add(&m.committed_words, 40);
        let snap = m.snapshot();
        assert_eq!(snap.commits, 2);
        assert_eq!(snap.committed_words, 40);
        assert_eq!(snap.rollbacks, 0);
    }
}
