//! The slot allocator.
//!
//! Coordinates the three allocation paths:
//! - large objects (> 2 KiB) take whole pages from the region;
//! - brackets `0..=10` allocate from a per-mutator thread-local run;
//! - the remaining brackets share one current run per bracket.
//!
//! Lock order, outermost first: bulk-free lock, thread-local slot lock,
//! bracket lock, region lock. The lifecycle log mutex is a leaf.
//! `free` holds the bulk-free lock for reading; `bulk_free` and revocation
//! hold it for writing, so a sweep never races an ordinary free.

use crate::config::RosAllocConfig;
use crate::error::AllocError;
use crate::log::{AllocatorLogLevel, AllocatorLogRecord, LifecycleLog, LogEvent};
use crate::metrics::{AllocatorMetrics, MetricsSnapshot};
use crate::page_map::{FreedPages, PageGrant, PageOwner, Region};
use crate::release::{NoopBacking, PageBacking};
use crate::run::Run;
use crate::size_class::{
    self, LARGE_SIZE_THRESHOLD, MAX_THREAD_LOCAL_BRACKET_IDX, NUM_SIZE_BRACKETS, SizeClassTable,
};
use crate::thread_cache::{MutatorId, NUM_THREAD_LOCAL_BRACKETS, ThreadRegistry, ThreadRuns};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

/// A successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub addr: usize,
    /// Bracket size for small objects, whole pages for large ones.
    pub bytes_charged: usize,
}

/// Where every live run currently sits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCensus {
    pub thread_local: usize,
    pub current: usize,
    pub non_full: usize,
    pub full: usize,
}

impl RunCensus {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.thread_local + self.current + self.non_full + self.full
    }
}

/// Runs of one bracket that no mutator holds privately.
#[derive(Debug, Default)]
struct BracketState {
    /// Shared allocation run (brackets above the thread-local range only).
    current_run: Option<Arc<Run>>,
    /// Keyed by run base so refills take the lowest address first.
    non_full_runs: BTreeMap<usize, Arc<Run>>,
    full_runs: BTreeMap<usize, Arc<Run>>,
}

impl BracketState {
    fn is_current(&self, run: &Arc<Run>) -> bool {
        self.current_run
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, run))
    }
}

/// Concurrent runs-of-slots allocator over one logical address region.
pub struct RosAlloc {
    config: RosAllocConfig,
    size_classes: Arc<SizeClassTable>,
    region: Region,
    brackets: Box<[Mutex<BracketState>]>,
    bulk_free_lock: RwLock<()>,
    threads: ThreadRegistry,
    metrics: AllocatorMetrics,
    log: LifecycleLog,
}

impl std::fmt::Debug for RosAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosAlloc")
            .field("config", &self.config)
            .field("region", &self.region)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

impl RosAlloc {
    /// Creates an allocator over `[base, base + capacity)` with no backing hooks.
    pub fn new(base: usize, capacity: usize, config: RosAllocConfig) -> Result<Self, AllocError> {
        Self::with_backing(base, capacity, capacity, config, Arc::new(NoopBacking))
    }

    /// Creates an allocator whose footprint limit starts at `capacity` and may
    /// be raised up to `max_capacity`.
    pub fn with_backing(
        base: usize,
        capacity: usize,
        max_capacity: usize,
        config: RosAllocConfig,
        backing: Arc<dyn PageBacking>,
    ) -> Result<Self, AllocError> {
        config.validate()?;
        let size_classes = Arc::new(SizeClassTable::new(config.page_size)?);
        let region = Region::new(
            base,
            config.page_size,
            capacity,
            max_capacity,
            config.page_release_mode,
            config.page_release_threshold,
            backing,
        )?;
        let allocator = Self {
            log: LifecycleLog::new(config.log_level, config.log_capacity),
            config,
            size_classes,
            region,
            brackets: (0..NUM_SIZE_BRACKETS)
                .map(|_| Mutex::new(BracketState::default()))
                .collect(),
            bulk_free_lock: RwLock::new(()),
            threads: ThreadRegistry::new(),
            metrics: AllocatorMetrics::new(),
        };
        allocator.log(AllocatorLogLevel::Info, "initialize", "region_ready", |ev| {
            ev.addr(base).size(capacity).details(format!(
                "page_size={} max_capacity={} release_mode={:?} release_threshold={}",
                allocator.config.page_size,
                allocator.region.reserved(),
                allocator.config.page_release_mode,
                allocator.config.page_release_threshold
            ))
        });
        Ok(allocator)
    }

    #[must_use]
    pub fn config(&self) -> &RosAllocConfig {
        &self.config
    }

    #[must_use]
    pub fn size_classes(&self) -> &Arc<SizeClassTable> {
        &self.size_classes
    }

    // ---------------------------------------------------------------------
    // logging helpers
    // ---------------------------------------------------------------------

    fn log(
        &self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        build: impl FnOnce(LogEvent) -> LogEvent,
    ) {
        if self.log.enabled(level) {
            self.log.record(
                build(LogEvent::new(level, symbol, event)),
                self.region.footprint(),
            );
        }
    }

    fn note_failure(&self, symbol: &'static str, err: &AllocError) {
        match err {
            AllocError::OutOfMemory { requested, .. } => {
                AllocatorMetrics::inc(&self.metrics.out_of_memory);
                self.log(AllocatorLogLevel::Warn, symbol, "out_of_memory", |ev| {
                    ev.size(*requested).outcome("denied").details(err.to_string())
                });
            }
            AllocError::InvalidFree { addr, .. } => {
                AllocatorMetrics::inc(&self.metrics.invalid_frees);
                self.log(AllocatorLogLevel::Warn, symbol, "invalid_free", |ev| {
                    ev.addr(*addr).outcome("rejected").details(err.to_string())
                });
            }
            AllocError::Corruption { .. } => {
                self.log(AllocatorLogLevel::Error, symbol, "corruption", |ev| {
                    ev.outcome("fatal").details(err.to_string())
                });
            }
            AllocError::InvalidConfig(_) => {
                self.log(AllocatorLogLevel::Warn, symbol, "invalid_request", |ev| {
                    ev.outcome("rejected").details(err.to_string())
                });
            }
        }
    }

    fn note_growth(&self, symbol: &'static str, grant: &PageGrant, bracket: Option<usize>) {
        if grant.grew_bytes == 0 {
            return;
        }
        AllocatorMetrics::inc(&self.metrics.footprint_grows);
        self.log(AllocatorLogLevel::Debug, symbol, "footprint_grow", |ev| {
            let ev = ev.addr(grant.addr).size(grant.grew_bytes);
            match bracket {
                Some(idx) => ev.bracket(idx),
                None => ev,
            }
        });
    }

    fn note_pages_freed(&self, symbol: &'static str, addr: usize, freed: FreedPages) {
        if freed.released_bytes == 0 {
            return;
        }
        AllocatorMetrics::add(&self.metrics.bytes_released, freed.released_bytes as u64);
        self.log(AllocatorLogLevel::Debug, symbol, "page_release", |ev| {
            ev.addr(addr).size(freed.released_bytes).details(format!(
                "mode={:?} freed={}",
                self.config.page_release_mode, freed.bytes
            ))
        });
    }

    // ---------------------------------------------------------------------
    // allocation
    // ---------------------------------------------------------------------

    /// Allocates `size` bytes on behalf of `thread`.
    pub fn allocate(&self, thread: MutatorId, size: usize) -> Result<Allocation, AllocError> {
        if thread.is_reserved() {
            let err = AllocError::InvalidConfig(format!("mutator id {} is reserved", thread.0));
            self.note_failure("allocate", &err);
            return Err(err);
        }
        if size > LARGE_SIZE_THRESHOLD {
            return self.allocate_large(size);
        }
        let (idx, bracket_size) = size_class::size_to_index_and_bracket_size(size);
        let result = if idx <= MAX_THREAD_LOCAL_BRACKET_IDX {
            self.allocate_thread_local(thread, idx)
        } else {
            self.allocate_shared(idx)
        };
        let addr = result.inspect_err(|err| self.note_failure("allocate", err))?;
        Ok(Allocation {
            addr,
            bytes_charged: bracket_size,
        })
    }

    fn allocate_large(&self, size: usize) -> Result<Allocation, AllocError> {
        let pages = size.div_ceil(self.config.page_size);
        let grant = self
            .region
            .allocate_pages(pages)
            .inspect_err(|err| self.note_failure("allocate", err))?;
        AllocatorMetrics::inc(&self.metrics.large_allocs);
        self.note_growth("allocate", &grant, None);
        Ok(Allocation {
            addr: grant.addr,
            bytes_charged: pages * self.config.page_size,
        })
    }

    fn allocate_thread_local(&self, thread: MutatorId, idx: usize) -> Result<usize, AllocError> {
        let runs = self.threads.get_or_register(thread);
        let mut slot = runs.slot(idx).lock();
        if let Some(addr) = slot.as_ref().and_then(|run| run.alloc_slot()) {
            AllocatorMetrics::inc(&self.metrics.thread_local_allocs);
            return Ok(addr);
        }

        let mut bracket = self.brackets[idx].lock();
        if let Some(run) = slot.take() {
            // Full: reclaim slots other threads freed before giving the run up.
            let (freed_any, _) = run.merge_thread_local_free_into_alloc();
            if freed_any && let Some(addr) = run.alloc_slot() {
                *slot = Some(run);
                AllocatorMetrics::inc(&self.metrics.thread_local_allocs);
                return Ok(addr);
            }
            run.set_thread_local(None);
            bracket.full_runs.insert(run.base(), run);
        }

        let run = self.refill_run(&mut bracket, idx)?;
        run.set_thread_local(Some(thread));
        drop(bracket);

        let addr = run.alloc_slot().ok_or_else(|| AllocError::Corruption {
            page: run.page_idx(),
            detail: "refilled run has no free slot".into(),
        })?;
        *slot = Some(run);
        AllocatorMetrics::inc(&self.metrics.thread_local_allocs);
        Ok(addr)
    }

    fn allocate_shared(&self, idx: usize) -> Result<usize, AllocError> {
        let mut bracket = self.brackets[idx].lock();
        if let Some(addr) = bracket.current_run.as_ref().and_then(|run| run.alloc_slot()) {
            AllocatorMetrics::inc(&self.metrics.shared_run_allocs);
            return Ok(addr);
        }
        if let Some(full) = bracket.current_run.take() {
            bracket.full_runs.insert(full.base(), full);
        }

        let run = self.refill_run(&mut bracket, idx)?;
        let addr = run.alloc_slot().ok_or_else(|| AllocError::Corruption {
            page: run.page_idx(),
            detail: "refilled run has no free slot".into(),
        })?;
        bracket.current_run = Some(run);
        AllocatorMetrics::inc(&self.metrics.shared_run_allocs);
        Ok(addr)
    }

    /// Takes the lowest-addressed non-full run, or carves a fresh one.
    /// Caller holds the bracket lock.
    fn refill_run(&self, bracket: &mut BracketState, idx: usize) -> Result<Arc<Run>, AllocError> {
        AllocatorMetrics::inc(&self.metrics.run_refills);
        if let Some((base, run)) = bracket.non_full_runs.pop_first() {
            self.log(AllocatorLogLevel::Trace, "allocate", "run_refill", |ev| {
                ev.addr(base).bracket(idx).outcome("reused")
            });
            return Ok(run);
        }
        let layout = self.size_classes.layout(idx);
        let (run, grant) = self.region.allocate_run(idx, layout)?;
        AllocatorMetrics::inc(&self.metrics.runs_created);
        self.note_growth("allocate", &grant, Some(idx));
        self.log(AllocatorLogLevel::Debug, "allocate", "run_refill", |ev| {
            ev.addr(run.base())
                .size(layout.run_bytes(self.config.page_size))
                .bracket(idx)
                .outcome("new_run")
                .details(format!(
                    "slots={} header={}",
                    layout.num_slots, layout.header_size
                ))
        });
        Ok(run)
    }

    // ---------------------------------------------------------------------
    // free
    // ---------------------------------------------------------------------

    /// Frees the object at `addr`. Returns the bytes released (the bracket
    /// size, or the large object's pages).
    pub fn free(&self, thread: MutatorId, addr: usize) -> Result<usize, AllocError> {
        let _shared = self.bulk_free_lock.read();
        let freed = match self
            .region
            .lookup(addr)
            .inspect_err(|err| self.note_failure("free", err))?
        {
            PageOwner::LargeObject { .. } => {
                let freed = self
                    .region
                    .free_large_object(addr)
                    .inspect_err(|err| self.note_failure("free", err))?;
                self.note_pages_freed("free", addr, freed);
                freed.bytes
            }
            PageOwner::Run(run) => self
                .free_from_run(thread, &run, addr)
                .inspect_err(|err| self.note_failure("free", err))?,
        };
        AllocatorMetrics::inc(&self.metrics.frees);
        Ok(freed)
    }

    fn free_from_run(
        &self,
        thread: MutatorId,
        run: &Arc<Run>,
        addr: usize,
    ) -> Result<usize, AllocError> {
        let idx = run.bracket_idx();
        let size = run.bracket_size();

        // The owner frees straight into the allocation bitmap.
        if idx <= MAX_THREAD_LOCAL_BRACKET_IDX && run.owner() == Some(thread) {
            if let Some(runs) = self.threads.get(thread) {
                let slot = runs.slot(idx).lock();
                if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, run)) {
                    run.free_slot(addr)?;
                    return Ok(size);
                }
            }
        }

        let mut bracket = self.brackets[idx].lock();
        if run.is_thread_local() {
            run.mark_thread_local_free(addr)?;
            return Ok(size);
        }
        run.free_slot(addr)?;
        self.settle_run(&mut bracket, run, "free")?;
        Ok(size)
    }

    /// Files a shared run under the set matching its occupancy, releasing its
    /// pages once every slot is free. Caller holds the bracket lock.
    fn settle_run(
        &self,
        bracket: &mut BracketState,
        run: &Arc<Run>,
        symbol: &'static str,
    ) -> Result<(), AllocError> {
        debug_assert!(!run.is_thread_local());
        if bracket.is_current(run) {
            return Ok(());
        }
        let base = run.base();
        if run.is_all_free() {
            bracket.non_full_runs.remove(&base);
            bracket.full_runs.remove(&base);
            let freed = self.region.free_run(run)?;
            AllocatorMetrics::inc(&self.metrics.runs_released);
            self.log(AllocatorLogLevel::Debug, symbol, "run_release", |ev| {
                ev.addr(base).size(freed.bytes).bracket(run.bracket_idx())
            });
            self.note_pages_freed(symbol, base, freed);
        } else if run.is_full() {
            bracket.non_full_runs.remove(&base);
            bracket.full_runs.insert(base, Arc::clone(run));
        } else {
            bracket.full_runs.remove(&base);
            bracket.non_full_runs.insert(base, Arc::clone(run));
        }
        Ok(())
    }

    /// Collector sweep: frees every address in `addrs`.
    ///
    /// The batch is validated before anything is freed, so an error leaves
    /// the heap untouched. Returns the bytes released.
    pub fn bulk_free(&self, thread: MutatorId, addrs: &[usize]) -> Result<usize, AllocError> {
        let _exclusive = self.bulk_free_lock.write();
        AllocatorMetrics::inc(&self.metrics.bulk_free_calls);
        let freed = self
            .bulk_free_locked(addrs)
            .inspect_err(|err| self.note_failure("bulk_free", err))?;
        AllocatorMetrics::add(&self.metrics.bulk_freed_objects, addrs.len() as u64);
        self.log(AllocatorLogLevel::Debug, "bulk_free", "sweep", |ev| {
            ev.size(freed)
                .details(format!("collector={} objects={}", thread.0, addrs.len()))
        });
        Ok(freed)
    }

    fn bulk_free_locked(&self, addrs: &[usize]) -> Result<usize, AllocError> {
        let mut seen = HashSet::with_capacity(addrs.len());
        let mut by_run: BTreeMap<usize, (Arc<Run>, Vec<usize>)> = BTreeMap::new();
        let mut large = Vec::new();
        for &addr in addrs {
            if !seen.insert(addr) {
                return Err(AllocError::InvalidFree {
                    addr,
                    reason: "duplicate address in bulk free",
                });
            }
            match self.region.lookup(addr)? {
                PageOwner::Run(run) => {
                    run.check_live(addr)?;
                    by_run
                        .entry(run.base())
                        .or_insert_with(|| (run, Vec::new()))
                        .1
                        .push(addr);
                }
                PageOwner::LargeObject { .. } => large.push(addr),
            }
        }

        // Mark without bracket locks; ordinary frees are excluded by the write lock.
        for (run, slots) in by_run.values() {
            run.set_to_be_bulk_freed(true);
            for &addr in slots {
                run.mark_bulk_free(addr)?;
            }
        }

        let mut freed = 0;
        for addr in large {
            let pages = self.region.free_large_object(addr)?;
            self.note_pages_freed("bulk_free", addr, pages);
            freed += pages.bytes;
        }

        for (run, slots) in by_run.into_values() {
            let mut bracket = self.brackets[run.bracket_idx()].lock();
            if run.is_thread_local() {
                run.union_bulk_free_into_thread_local();
            } else {
                run.merge_bulk_free_into_alloc();
                self.settle_run(&mut bracket, &run, "bulk_free")?;
            }
            run.set_to_be_bulk_freed(false);
            freed += slots.len() * run.bracket_size();
        }
        Ok(freed)
    }

    // ---------------------------------------------------------------------
    // revocation
    // ---------------------------------------------------------------------

    /// Returns `thread`'s thread-local runs to the shared sets. Returns the
    /// number of runs revoked.
    pub fn revoke_thread_local_runs(&self, thread: MutatorId) -> Result<usize, AllocError> {
        let _exclusive = self.bulk_free_lock.write();
        match self.threads.get(thread) {
            Some(runs) => self.revoke_locked(thread, &runs),
            None => Ok(0),
        }
    }

    /// Revokes the thread-local runs of every registered mutator, then
    /// retires shared current runs that no longer hold a live slot.
    ///
    /// Returns the number of thread-local runs revoked.
    pub fn revoke_all_thread_local_runs(&self) -> Result<usize, AllocError> {
        let _exclusive = self.bulk_free_lock.write();
        let mut revoked = 0;
        for (thread, runs) in self.threads.snapshot() {
            revoked += self.revoke_locked(thread, &runs)?;
        }
        for idx in NUM_THREAD_LOCAL_BRACKETS..NUM_SIZE_BRACKETS {
            let mut bracket = self.brackets[idx].lock();
            if let Some(run) = bracket.current_run.take_if(|run| run.is_all_free()) {
                self.settle_run(&mut bracket, &run, "revoke")?;
            }
        }
        Ok(revoked)
    }

    /// Revokes `thread`'s runs and forgets it. Call when the mutator exits.
    pub fn detach_thread(&self, thread: MutatorId) -> Result<usize, AllocError> {
        let _exclusive = self.bulk_free_lock.write();
        match self.threads.remove(thread) {
            Some(runs) => self.revoke_locked(thread, &runs),
            None => Ok(0),
        }
    }

    fn revoke_locked(&self, thread: MutatorId, runs: &ThreadRuns) -> Result<usize, AllocError> {
        let mut revoked = 0;
        for idx in 0..NUM_THREAD_LOCAL_BRACKETS {
            let mut slot = runs.slot(idx).lock();
            let Some(run) = slot.take() else {
                continue;
            };
            let mut bracket = self.brackets[idx].lock();
            run.merge_thread_local_free_into_alloc();
            run.set_thread_local(None);
            run.merge_bulk_free_into_alloc();
            self.settle_run(&mut bracket, &run, "revoke")
                .inspect_err(|err| self.note_failure("revoke", err))?;
            revoked += 1;
        }
        if revoked > 0 {
            AllocatorMetrics::add(&self.metrics.runs_revoked, revoked as u64);
            self.log(AllocatorLogLevel::Debug, "revoke", "thread_local_runs", |ev| {
                ev.details(format!("thread={} runs={revoked}", thread.0))
            });
        }
        Ok(revoked)
    }

    // ---------------------------------------------------------------------
    // queries and tuning
    // ---------------------------------------------------------------------

    /// Bytes charged for the live object at `addr`.
    pub fn usable_size(&self, addr: usize) -> Result<usize, AllocError> {
        match self.region.lookup(addr)? {
            PageOwner::Run(run) => {
                run.slot_index(addr)?;
                Ok(run.bracket_size())
            }
            PageOwner::LargeObject { bytes, .. } => Ok(bytes),
        }
    }

    /// Bytes a request of `size` would be charged, without allocating.
    #[must_use]
    pub fn usable_size_for(&self, size: usize) -> usize {
        size_class::usable_size_for(size, self.config.page_size)
    }

    #[must_use]
    pub fn footprint(&self) -> usize {
        self.region.footprint()
    }

    #[must_use]
    pub fn footprint_limit(&self) -> usize {
        self.region.footprint_limit()
    }

    /// Raises the footprint limit; lower values are ignored. Returns the limit in effect.
    pub fn set_footprint_limit(&self, bytes: usize) -> usize {
        let limit = self.region.set_footprint_limit(bytes);
        self.log(AllocatorLogLevel::Info, "set_footprint_limit", "limit", |ev| {
            ev.size(limit).details(format!("requested={bytes}"))
        });
        limit
    }

    /// Shrinks the footprint by the trailing free pages, if any.
    pub fn trim(&self) -> bool {
        match self.region.trim() {
            Some(bytes) => {
                AllocatorMetrics::inc(&self.metrics.trims);
                self.log(AllocatorLogLevel::Info, "trim", "footprint_shrink", |ev| {
                    ev.size(bytes)
                });
                true
            }
            None => false,
        }
    }

    /// Visits free page runs, large objects, and run slots as
    /// `(start, end, used_bytes)` in address order. Free space reports zero
    /// used bytes. `visitor` must not call back into the allocator.
    pub fn inspect_all<F>(&self, mut visitor: F)
    where
        F: FnMut(usize, usize, usize),
    {
        self.region.inspect(&mut visitor);
    }

    /// Bytes held by live objects, counted at bracket or page granularity.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        let mut total = 0;
        self.inspect_all(|_, _, used| total += used);
        total
    }

    #[must_use]
    pub fn objects_allocated(&self) -> usize {
        let mut count = 0;
        self.inspect_all(|_, _, used| count += usize::from(used > 0));
        count
    }

    #[must_use]
    pub fn does_release_all_pages(&self) -> bool {
        self.config.page_release_mode.releases_all()
    }

    /// Counts live runs by ownership.
    #[must_use]
    pub fn run_census(&self) -> RunCensus {
        let mut census = RunCensus::default();
        for (_, runs) in self.threads.snapshot() {
            census.thread_local += runs.installed();
        }
        for bracket in self.brackets.iter() {
            let bracket = bracket.lock();
            census.current += usize::from(bracket.current_run.is_some());
            census.non_full += bracket.non_full_runs.len();
            census.full += bracket.full_runs.len();
        }
        census
    }

    #[must_use]
    pub fn dump_page_map(&self) -> String {
        self.region.dump_page_map()
    }

    /// Dumps every run, grouped by bracket and ownership.
    #[must_use]
    pub fn dump_runs(&self) -> String {
        let mut out = String::new();
        for (thread, runs) in self.threads.snapshot() {
            for idx in 0..NUM_THREAD_LOCAL_BRACKETS {
                if let Some(run) = runs.slot(idx).lock().as_ref() {
                    let _ = write!(out, "thread {} bracket {idx}: {}", thread.0, run.dump());
                }
            }
        }
        for (idx, bracket) in self.brackets.iter().enumerate() {
            let bracket = bracket.lock();
            if let Some(run) = &bracket.current_run {
                let _ = write!(out, "bracket {idx} current: {}", run.dump());
            }
            for run in bracket.non_full_runs.values() {
                let _ = write!(out, "bracket {idx} non-full: {}", run.dump());
            }
            for run in bracket.full_runs.values() {
                let _ = write!(out, "bracket {idx} full: {}", run.dump());
            }
        }
        out
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Retained lifecycle records, oldest first.
    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.log.snapshot()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.log.drain()
    }
}
