//! Collector-side benchmarks: batched frees and revocation.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rosalloc_core::{MutatorId, PageReleaseMode, RosAlloc, RosAllocConfig};
use std::hint::black_box;

const BASE: usize = 0x4000_0000;
const CAPACITY: usize = 512 << 20;
const COLLECTOR: MutatorId = MutatorId(1_000);

fn populated(mutators: u64, per_mutator: usize) -> (RosAlloc, Vec<usize>) {
    let config = RosAllocConfig::default().with_release_mode(PageReleaseMode::All);
    let a = RosAlloc::new(BASE, CAPACITY, config).unwrap();
    let mut addrs = Vec::with_capacity(mutators as usize * per_mutator);
    for m in 0..mutators {
        for i in 0..per_mutator {
            let size = 16 + (i * 37) % 700;
            addrs.push(a.allocate(MutatorId(m), size).unwrap().addr);
        }
    }
    (a, addrs)
}

fn bench_bulk_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_free");

    for &batch in &[64usize, 1024, 16384] {
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &n| {
            b.iter_with_setup(
                || populated(4, n / 4),
                |(a, addrs)| black_box(a.bulk_free(COLLECTOR, &addrs).unwrap()),
            );
        });
        group.bench_with_input(BenchmarkId::new("single_frees", batch), &batch, |b, &n| {
            b.iter_with_setup(
                || populated(4, n / 4),
                |(a, addrs)| {
                    for addr in addrs {
                        black_box(a.free(COLLECTOR, addr).unwrap());
                    }
                },
            );
        });
    }
    group.finish();
}

fn bench_revoke(c: &mut Criterion) {
    c.bench_function("revoke_all_8_mutators", |b| {
        b.iter_with_setup(
            || populated(8, 256),
            |(a, _)| black_box(a.revoke_all_thread_local_runs().unwrap()),
        );
    });
}

criterion_group!(benches, bench_bulk_free, bench_revoke);
criterion_main!(benches);
