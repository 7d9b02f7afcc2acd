use rosalloc_core::{MutatorId, PageReleaseMode, RosAlloc, RosAllocConfig};
use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;

const BASE: usize = 0x4000_0000;
const CAPACITY: usize = 64 << 20;
const WORKERS: u64 = 6;
const OPS_PER_WORKER: usize = 6_000;
const COLLECTOR: MutatorId = MutatorId(1_000);

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
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
        _ => rng.gen_range(2049, 12_000),
    }
}

/// One mutator: allocates, frees some objects itself, frees some on behalf
/// of a neighbour id, and hands garbage to the collector. Returns the
/// objects it still holds.
fn mutate(a: &RosAlloc, id: u64, garbage: mpsc::Sender<Vec<usize>>) -> Vec<usize> {
    let me = MutatorId(id);
    let neighbour = MutatorId((id + 1) % WORKERS);
    let mut rng = XorShift64::new(0x9e37_79b9_7f4a_7c15 ^ (id + 1));
    let mut live = Vec::new();
    let mut batch = Vec::new();

    for _ in 0..OPS_PER_WORKER {
        match rng.gen_range(0, 99) {
            0..=54 => live.push(a.allocate(me, request_size(&mut rng)).unwrap().addr),
            55..=69 if !live.is_empty() => {
                let addr = live.swap_remove(rng.gen_range(0, live.len() - 1));
                a.free(me, addr).unwrap();
            }
            70..=79 if !live.is_empty() => {
                let addr = live.swap_remove(rng.gen_range(0, live.len() - 1));
                a.free(neighbour, addr).unwrap();
            }
            80..=99 if !live.is_empty() => {
                batch.push(live.swap_remove(rng.gen_range(0, live.len() - 1)));
                if batch.len() >= 64 {
                    garbage.send(std::mem::take(&mut batch)).unwrap();
                }
            }
            _ => {}
        }
    }
    if !batch.is_empty() {
        garbage.send(batch).unwrap();
    }
    live
}

fn run_storm(mode: PageReleaseMode) -> (RosAlloc, Vec<usize>) {
    let config = RosAllocConfig::default().with_release_mode(mode);
    let a = RosAlloc::new(BASE, CAPACITY, config).unwrap();
    let (tx, rx) = mpsc::channel::<Vec<usize>>();

    let survivors = thread::scope(|s| {
        let collector = s.spawn(|| {
            let mut swept = 0;
            for batch in rx {
                a.bulk_free(COLLECTOR, &batch).unwrap();
                swept += batch.len();
            }
            swept
        });
        let workers: Vec<_> = (0..WORKERS)
            .map(|id| {
                let tx = tx.clone();
                let a = &a;
                s.spawn(move || mutate(a, id, tx))
            })
            .collect();
        drop(tx);

        let survivors: Vec<usize> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        assert!(collector.join().unwrap() > 0);
        survivors
    });
    (a, survivors)
}

#[test]
fn bitmaps_match_survivors_after_concurrent_sweep() {
    let (a, survivors) = run_storm(PageReleaseMode::SizeAndEnd);
    a.revoke_all_thread_local_runs().unwrap();

    let expected: HashSet<usize> = survivors.iter().copied().collect();
    assert_eq!(expected.len(), survivors.len(), "live objects alias");

    let mut reported = HashSet::new();
    a.inspect_all(|start, _end, used| {
        if used > 0 {
            assert!(reported.insert(start));
        }
    });
    assert_eq!(reported, expected);

    let metrics = a.metrics();
    assert!(metrics.bulk_free_calls > 0);
    assert!(metrics.thread_local_allocs > 0);
    assert_eq!(metrics.invalid_frees, 0);
}

#[test]
fn heap_drains_to_zero_after_storm() {
    let (a, survivors) = run_storm(PageReleaseMode::All);
    a.bulk_free(COLLECTOR, &survivors).unwrap();
    a.revoke_all_thread_local_runs().unwrap();
    assert_eq!(a.objects_allocated(), 0);
    assert!(a.trim());
    assert_eq!(a.footprint(), 0);
    assert_eq!(a.run_census().total(), 0);
}
