//! Atomic counters for allocator observability.
//!
//! All counters use relaxed ordering: they are diagnostic, not
//! synchronization primitives. Each allocator instance owns its counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-allocator operation counters.
#[derive(Debug)]
pub struct AllocatorMetrics {
    /// Small allocations served from a thread-local run.
    pub thread_local_allocs: AtomicU64,
    /// Small allocations served from a bracket's shared current run.
    pub shared_run_allocs: AtomicU64,
    /// Large-object allocations.
    pub large_allocs: AtomicU64,
    /// Single-object frees.
    pub frees: AtomicU64,
    /// Bulk-free batches.
    pub bulk_free_calls: AtomicU64,
    /// Objects released through bulk free.
    pub bulk_freed_objects: AtomicU64,
    /// Current-run replacements (thread-local or shared).
    pub run_refills: AtomicU64,
    /// Fresh runs carved from the page map.
    pub runs_created: AtomicU64,
    /// Runs whose pages went back to the page map.
    pub runs_released: AtomicU64,
    /// Thread-local runs detached by revocation.
    pub runs_revoked: AtomicU64,
    /// Footprint growth events.
    pub footprint_grows: AtomicU64,
    /// Bytes passed to the backing release hook.
    pub bytes_released: AtomicU64,
    /// Successful trims.
    pub trims: AtomicU64,
    /// Requests refused for lack of space.
    pub out_of_memory: AtomicU64,
    /// Rejected frees.
    pub invalid_frees: AtomicU64,
}

impl AllocatorMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            thread_local_allocs: AtomicU64::new(0),
            shared_run_allocs: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            bulk_free_calls: AtomicU64::new(0),
            bulk_freed_objects: AtomicU64::new(0),
            run_refills: AtomicU64::new(0),
            runs_created: AtomicU64::new(0),
            runs_released: AtomicU64::new(0),
            runs_revoked: AtomicU64::new(0),
            footprint_grows: AtomicU64::new(0),
            bytes_released: AtomicU64::new(0),
            trims: AtomicU64::new(0),
            out_of_memory: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
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
            thread_local_allocs: Self::get(&self.thread_local_allocs),
            shared_run_allocs: Self::get(&self.shared_run_allocs),
            large_allocs: Self::get(&self.large_allocs),
            frees: Self::get(&self.frees),
            bulk_free_calls: Self::get(&self.bulk_free_calls),
            bulk_freed_objects: Self::get(&self.bulk_freed_objects),
            run_refills: Self::get(&self.run_refills),
            runs_created: Self::get(&self.runs_created),
            runs_released: Self::get(&self.runs_released),
            runs_revoked: Self::get(&self.runs_revoked),
            footprint_grows: Self::get(&self.footprint_grows),
            bytes_released: Self::get(&self.bytes_released),
            trims: Self::get(&self.trims),
            out_of_memory: Self::get(&self.out_of_memory),
            invalid_frees: Self::get(&self.invalid_frees),
        }
    }
}

impl Default for AllocatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub thread_local_allocs: u64,
    pub shared_run_allocs: u64,
    pub large_allocs: u64,
    pub frees: u64,
    pub bulk_free_calls: u64,
    pub bulk_freed_objects: u64,
    pub run_refills: u64,
    pub runs_created: u64,
    pub runs_released: u64,
    pub runs_revoked: u64,
    pub footprint_grows: u64,
    pub bytes_released: u64,
    pub trims: u64,
    pub out_of_memory: u64,
    pub invalid_frees: u64,
}

impl MetricsSnapshot {
    /// Total successful allocations of any kind.
    #[must_use]
    pub const fn total_allocs(&self) -> u64 {
        self.thread_local_allocs + self.shared_run_allocs + self.large_allocs
    }

    /// Share of small allocations served thread-locally, in permille.
    #[must_use]
    pub fn thread_local_permille(&self) -> u16 {
        let small = self.thread_local_allocs + self.shared_run_allocs;
        if small == 0 {
            return 0;
        }
        ((self.thread_local_allocs.saturating_mul(1000)) / small) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = AllocatorMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
        assert_eq!(snap.thread_local_permille(), 0);
    }

    #[test]
    fn inc_add_and_snapshot() {
        let m = AllocatorMetrics::new();
        AllocatorMetrics::inc(&m.thread_local_allocs);
        AllocatorMetrics::inc(&m.thread_local_allocs);
        AllocatorMetrics::inc(&m.thread_local_allocs);
        AllocatorMetrics::inc(&m.shared_run_allocs);
        AllocatorMetrics::add(&m.bulk_freed_objects, 17);
        let snap = m.snapshot();
        assert_eq!(snap.total_allocs(), 4);
        assert_eq!(snap.bulk_freed_objects, 17);
        assert_eq!(snap.thread_local_permille(), 750);
    }
}
