use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated on every cache operation.
///
/// All counters are monotonic and updated with relaxed ordering — a
/// snapshot is a consistent-enough point-in-time view, never an exact one.
pub struct StatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_time: AtomicU64,
    evictions: AtomicU64,
    eviction_weight: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        StatsCounter {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            load_successes: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            total_load_time: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            eviction_weight: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_load_success(&self, load_time_nanos: u64) {
        self.load_successes.fetch_add(1, Ordering::Relaxed);
        self.total_load_time
            .fetch_add(load_time_nanos, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_load_failure(&self, load_time_nanos: u64) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.total_load_time
            .fetch_add(load_time_nanos, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eviction(&self, weight: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.eviction_weight.fetch_add(weight, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the statistics.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            load_success_count: self.load_successes.load(Ordering::Relaxed),
            load_failure_count: self.load_failures.load(Ordering::Relaxed),
            total_load_time_nanos: self.total_load_time.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
            eviction_weight: self.eviction_weight.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups that found a live entry.
    pub hit_count: u64,
    /// Number of lookups that found nothing (or an expired entry).
    pub miss_count: u64,
    /// Number of loader invocations that returned a value.
    pub load_success_count: u64,
    /// Number of loader invocations that returned an error.
    pub load_failure_count: u64,
    /// Total nanoseconds spent inside the loader, successful or not.
    pub total_load_time_nanos: u64,
    /// Number of entries evicted by size pressure or expiration.
    pub eviction_count: u64,
    /// Total weight of evicted entries.
    pub eviction_weight: u64,
}

impl CacheStats {
    pub fn request_count(&self) -> u64 {
        self.hit_count + self.miss_count
    }

    /// `hit_count / request_count`, or `0.0` before the first request.
    pub fn hit_rate(&self) -> f64 {
        let total = self.request_count();
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }

    /// Mean nanoseconds per loader invocation, or `0.0` with no loads.
    pub fn average_load_penalty_nanos(&self) -> f64 {
        let loads = self.load_success_count + self.load_failure_count;
        if loads == 0 {
            0.0
        } else {
            self.total_load_time_nanos as f64 / loads as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let c = StatsCounter::new();
        c.record_hit();
        c.record_hit();
        c.record_miss();
        c.record_load_success(100);
        c.record_load_failure(50);
        c.record_eviction(3);

        let s = c.snapshot();
        assert_eq!(s.hit_count, 2);
        assert_eq!(s.miss_count, 1);
        assert_eq!(s.load_success_count, 1);
        assert_eq!(s.load_failure_count, 1);
        assert_eq!(s.total_load_time_nanos, 150);
        assert_eq!(s.eviction_count, 1);
        assert_eq!(s.eviction_weight, 3);
        assert_eq!(s.request_count(), 3);
        assert!((s.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((s.average_load_penalty_nanos() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn rates_are_zero_with_no_activity() {
        let s = StatsCounter::new().snapshot();
        assert_eq!(s.hit_rate(), 0.0);
        assert_eq!(s.average_load_penalty_nanos(), 0.0);
    }
}
