//! Multi-mutator churn workload.
//!
//! Mutator threads allocate a skewed mix of small, medium and large
//! objects, free some of their own, free some on behalf of a neighbour, and
//! hand the rest to a collector thread that reclaims them in batches with
//! `bulk_free`. When the mutators finish, the harness revokes every
//! thread-local run, checks that the allocator's bitmaps report exactly the
//! surviving objects, drains the heap and trims it.

use crate::error::HarnessError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
use rosalloc_core::{
    AllocError, AllocatorLogLevel, MetricsSnapshot, MutatorId, PageReleaseMode, RosAlloc,
    RosAllocConfig, RunCensus,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

/// Logical base address of the simulated heap.
pub const DEFAULT_BASE: usize = 0x4000_0000;

/// Parameters of one stress run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadConfig {
    pub seed: u64,
    pub mutators: u64,
    pub ops_per_mutator: usize,
    /// Objects per collector batch.
    pub batch_size: usize,
    pub base: usize,
    pub capacity: usize,
    pub page_size: usize,
    pub release_mode: PageReleaseMode,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0x9e37_79b9_7f4a_7c15,
            mutators: 4,
            ops_per_mutator: 10_000,
            batch_size: 64,
            base: DEFAULT_BASE,
            capacity: 256 << 20,
            page_size: 4096,
            release_mode: PageReleaseMode::default(),
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.mutators == 0 {
            return Err(HarnessError::InvalidWorkload(
                "at least one mutator is required".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(HarnessError::InvalidWorkload(
                "batch size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Id the collector thread uses for its bulk frees. Never collides with
    /// a mutator id.
    #[must_use]
    pub const fn collector_id(&self) -> MutatorId {
        MutatorId(self.mutators)
    }
}

/// Summary of one stress run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub allocations: u64,
    pub own_frees: u64,
    pub foreign_frees: u64,
    pub swept_objects: u64,
    pub swept_bytes: usize,
    pub out_of_memory: u64,
    pub survivors: usize,
    pub peak_footprint: usize,
    /// Census right after revoking all thread-local runs.
    pub census_after_revoke: RunCensus,
    /// Whether the bitmaps reported exactly the surviving objects.
    pub consistent: bool,
    pub footprint_after_drain: usize,
    pub trimmed: bool,
    pub final_footprint: usize,
    pub duration_ms: u64,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // Zero is a fixed point of the generator.
        Self {
            state: if seed == 0 { 0x2545_F491 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

fn request_size(rng: &mut XorShift64) -> usize {
    match rng.gen_range(0, 99) {
        0..=69 => rng.gen_range(1, 176),
        70..=96 => rng.gen_range(177, 2048),
        _ => rng.gen_range(2049, 16_384),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MutatorStats {
    allocations: u64,
    own_frees: u64,
    foreign_frees: u64,
    out_of_memory: u64,
}

impl MutatorStats {
    fn merge(&mut self, other: Self) {
        self.allocations += other.allocations;
        self.own_frees += other.own_frees;
        self.foreign_frees += other.foreign_frees;
        self.out_of_memory += other.out_of_memory;
    }
}

struct Mutator<'a> {
    alloc: &'a RosAlloc,
    config: &'a WorkloadConfig,
    id: u64,
    peak_footprint: &'a AtomicUsize,
}

impl Mutator<'_> {
    fn run(
        &self,
        garbage: mpsc::Sender<Vec<usize>>,
    ) -> Result<(Vec<usize>, MutatorStats), AllocError> {
        let me = MutatorId(self.id);
        let neighbour = MutatorId((self.id + 1) % self.config.mutators);
        let mut rng = XorShift64::new(self.config.seed ^ (self.id + 1));
        let mut stats = MutatorStats::default();
        let mut live = Vec::new();
        let mut batch = Vec::with_capacity(self.config.batch_size);

        for _ in 0..self.config.ops_per_mutator {
            match rng.gen_range(0, 99) {
                0..=54 => match self.alloc.allocate(me, request_size(&mut rng)) {
                    Ok(obj) => {
                        live.push(obj.addr);
                        stats.allocations += 1;
                        self.peak_footprint
                            .fetch_max(self.alloc.footprint(), Ordering::Relaxed);
                    }
                    Err(err) if err.is_out_of_memory() => stats.out_of_memory += 1,
                    Err(err) => return Err(err),
                },
                55..=69 if !live.is_empty() => {
                    let addr = live.swap_remove(rng.gen_range(0, live.len() - 1));
                    self.alloc.free(me, addr)?;
                    stats.own_frees += 1;
                }
                70..=79 if !live.is_empty() => {
                    let addr = live.swap_remove(rng.gen_range(0, live.len() - 1));
                    self.alloc.free(neighbour, addr)?;
                    stats.foreign_frees += 1;
                }
                80..=99 if !live.is_empty() => {
                    batch.push(live.swap_remove(rng.gen_range(0, live.len() - 1)));
                    if batch.len() >= self.config.batch_size {
                        // The collector only stops once every sender is gone.
                        let _ = garbage.send(std::mem::take(&mut batch));
                    }
                }
                _ => {}
            }
        }
        if !batch.is_empty() {
            let _ = garbage.send(batch);
        }
        Ok((live, stats))
    }
}

fn mode_label(mode: PageReleaseMode) -> String {
    serde_json::to_value(mode)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Runs the churn workload and logs each phase to `emitter`.
pub fn run_workload(
    config: &WorkloadConfig,
    emitter: &mut LogEmitter,
) -> Result<WorkloadReport, HarnessError> {
    config.validate()?;
    let started = Instant::now();
    let mode = mode_label(config.release_mode);
    let alloc_config = RosAllocConfig::default()
        .with_page_size(config.page_size)
        .with_release_mode(config.release_mode)
        .with_log(AllocatorLogLevel::Debug, 4096);
    let alloc = RosAlloc::new(config.base, config.capacity, alloc_config)?;

    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "workload_start")
            .with_release_mode(&mode)
            .with_details(serde_json::to_value(config)?),
    )?;

    let peak_footprint = AtomicUsize::new(0);
    let collector = config.collector_id();
    let (tx, rx) = mpsc::channel::<Vec<usize>>();

    let (survivors, stats, swept_objects, swept_bytes) =
        thread::scope(|s| -> Result<_, HarnessError> {
            let alloc = &alloc;
            let sweeper = s.spawn(move || -> Result<(u64, usize), AllocError> {
                let mut objects = 0u64;
                let mut bytes = 0usize;
                for batch in rx {
                    bytes += alloc.bulk_free(collector, &batch)?;
                    objects += batch.len() as u64;
                }
                Ok((objects, bytes))
            });

            let workers: Vec<_> = (0..config.mutators)
                .map(|id| {
                    let tx = tx.clone();
                    let mutator = Mutator {
                        alloc,
                        config,
                        id,
                        peak_footprint: &peak_footprint,
                    };
                    (id, s.spawn(move || mutator.run(tx)))
                })
                .collect();
            drop(tx);

            let mut survivors = Vec::new();
            let mut stats = MutatorStats::default();
            for (id, worker) in workers {
                let (live, worker_stats) = worker
                    .join()
                    .map_err(|_| HarnessError::MutatorPanicked(id))??;
                survivors.extend(live);
                stats.merge(worker_stats);
            }
            let (swept_objects, swept_bytes) = sweeper
                .join()
                .map_err(|_| HarnessError::MutatorPanicked(collector.0))??;
            Ok((survivors, stats, swept_objects, swept_bytes))
        })?;

    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "mutators_done")
            .with_footprint(alloc.footprint())
            .with_details(serde_json::json!({
                "allocations": stats.allocations,
                "own_frees": stats.own_frees,
                "foreign_frees": stats.foreign_frees,
                "swept_objects": swept_objects,
                "out_of_memory": stats.out_of_memory,
                "survivors": survivors.len(),
            })),
    )?;

    alloc.revoke_all_thread_local_runs()?;
    let census_after_revoke = alloc.run_census();
    let expected: HashSet<usize> = survivors.iter().copied().collect();
    let mut reported = HashSet::new();
    let mut duplicate_reports = 0usize;
    alloc.inspect_all(|start, _end, used| {
        if used > 0 && !reported.insert(start) {
            duplicate_reports += 1;
        }
    });
    let consistent =
        duplicate_reports == 0 && expected.len() == survivors.len() && reported == expected;
    emitter.emit_entry(
        LogEntry::new(
            "",
            if consistent { LogLevel::Info } else { LogLevel::Error },
            "bitmap_check",
        )
        .with_symbol("inspect_all")
        .with_outcome(if consistent { Outcome::Pass } else { Outcome::Fail })
        .with_details(serde_json::json!({
            "expected": expected.len(),
            "reported": reported.len(),
            "census": census_after_revoke,
        })),
    )?;
    emitter.forward_lifecycle(&alloc.drain_lifecycle_logs())?;

    alloc.bulk_free(collector, &survivors)?;
    alloc.revoke_all_thread_local_runs()?;
    let footprint_after_drain = alloc.footprint();
    let trimmed = alloc.trim();
    let final_footprint = alloc.footprint();
    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "drain")
            .with_symbol("trim")
            .with_release_mode(&mode)
            .with_footprint(final_footprint)
            .with_outcome(if alloc.objects_allocated() == 0 {
                Outcome::Pass
            } else {
                Outcome::Fail
            })
            .with_details(serde_json::json!({
                "footprint_after_drain": footprint_after_drain,
                "trimmed": trimmed,
                "objects_allocated": alloc.objects_allocated(),
            })),
    )?;
    emitter.forward_lifecycle(&alloc.drain_lifecycle_logs())?;

    let metrics = alloc.metrics();
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "workload_end")
            .with_outcome(if consistent { Outcome::Pass } else { Outcome::Fail })
            .with_duration_ms(duration_ms)
            .with_details(serde_json::to_value(metrics)?),
    )?;
    emitter.flush()?;

    Ok(WorkloadReport {
        allocations: stats.allocations,
        own_frees: stats.own_frees,
        foreign_frees: stats.foreign_frees,
        swept_objects,
        swept_bytes,
        out_of_memory: stats.out_of_memory,
        survivors: survivors.len(),
        peak_footprint: peak_footprint.into_inner(),
        census_after_revoke,
        consistent,
        footprint_after_drain,
        trimmed,
        final_footprint,
        duration_ms,
        metrics,
    })
}
