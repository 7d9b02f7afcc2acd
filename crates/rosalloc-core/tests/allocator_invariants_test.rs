use rosalloc_core::size_class::{self, LARGE_SIZE_THRESHOLD, NUM_SIZE_BRACKETS, SizeClassTable};
use rosalloc_core::{
    AllocError, BackingEvent, MutatorId, PageReleaseMode, RecordingBacking, RosAlloc,
    RosAllocConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const BASE: usize = 0x1000_0000;
const MIB: usize = 1 << 20;
const T1: MutatorId = MutatorId(1);

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

fn allocator(mode: PageReleaseMode) -> RosAlloc {
    let config = RosAllocConfig::default().with_release_mode(mode);
    RosAlloc::new(BASE, 16 * MIB, config).unwrap()
}

#[test]
fn usable_size_is_a_bracket_at_least_the_request() {
    let a = allocator(PageReleaseMode::None);
    let brackets: Vec<usize> = (0..NUM_SIZE_BRACKETS).map(size_class::bracket_size).collect();
    for s in 16..=LARGE_SIZE_THRESHOLD {
        let usable = a.usable_size_for(s);
        assert!(usable >= s, "usable_size_for({s}) = {usable}");
        assert!(brackets.contains(&usable), "{usable} is not a bracket size");
    }
}

#[test]
fn threshold_boundary_selects_path() {
    let a = allocator(PageReleaseMode::None);
    let small = a.allocate(T1, 2048).unwrap();
    assert_eq!(small.bytes_charged, 2048);
    let large = a.allocate(T1, 2049).unwrap();
    assert_eq!(large.bytes_charged, 4096);
    let metrics = a.metrics();
    assert_eq!(metrics.large_allocs, 1);
    assert_eq!(metrics.shared_run_allocs, 1);
}

#[test]
fn single_thread_free_then_allocate_returns_same_address() {
    let a = allocator(PageReleaseMode::None);
    let first = a.allocate(T1, 24).unwrap();
    assert_eq!(a.usable_size(first.addr).unwrap(), 32);
    a.free(T1, first.addr).unwrap();
    let second = a.allocate(T1, 24).unwrap();
    assert_eq!(second.addr, first.addr);
}

#[test]
fn first_large_allocation_grows_footprint_by_one_page() {
    let a = allocator(PageReleaseMode::None);
    assert_eq!(a.footprint(), 0);
    a.allocate(T1, 3000).unwrap();
    assert_eq!(a.footprint(), 4096);
}

#[test]
fn live_allocations_never_overlap() {
    let a = allocator(PageReleaseMode::SizeAndEnd);
    let mut rng = XorShift64::new(0x5eed_1234);
    // start -> end of every live object
    let mut live: BTreeMap<usize, usize> = BTreeMap::new();

    for _ in 0..20_000 {
        if live.is_empty() || rng.gen_range(0, 99) < 60 {
            let size = match rng.gen_range(0, 99) {
                0..=79 => rng.gen_range(1, 256),
                80..=97 => rng.gen_range(257, 2048),
                _ => rng.gen_range(2049, 20_000),
            };
            let obj = a.allocate(T1, size).unwrap();
            assert!(obj.bytes_charged >= size);
            let end = obj.addr + obj.bytes_charged;
            if let Some((_, &prev_end)) = live.range(..=obj.addr).next_back() {
                assert!(prev_end <= obj.addr, "{:#x} overlaps a live object", obj.addr);
            }
            if let Some((&next_start, _)) = live.range(obj.addr + 1..).next() {
                assert!(end <= next_start, "{:#x} overlaps a live object", obj.addr);
            }
            live.insert(obj.addr, end);
        } else {
            let nth = rng.gen_range(0, live.len() - 1);
            let addr = *live.keys().nth(nth).unwrap();
            let end = live.remove(&addr).unwrap();
            assert_eq!(a.free(T1, addr).unwrap(), end - addr);
        }
    }

    assert_eq!(a.objects_allocated(), live.len());
    let expected: usize = live.iter().map(|(start, end)| end - start).sum();
    assert_eq!(a.bytes_allocated(), expected);
}

#[test]
fn round_trip_with_release_all_restores_footprint() {
    let backing = Arc::new(RecordingBacking::new());
    let config = RosAllocConfig::default().with_release_mode(PageReleaseMode::All);
    let a = RosAlloc::with_backing(BASE, 16 * MIB, 16 * MIB, config, backing.clone()).unwrap();
    let before = a.footprint();

    let mut rng = XorShift64::new(42);
    let addrs: Vec<usize> = (0..3_000)
        .map(|_| a.allocate(T1, rng.gen_range(1, 4_000)).unwrap().addr)
        .collect();
    assert!(a.footprint() > before);

    let (singles, batch) = addrs.split_at(addrs.len() / 3);
    for &addr in singles {
        a.free(T1, addr).unwrap();
    }
    a.bulk_free(MutatorId(99), batch).unwrap();
    a.revoke_all_thread_local_runs().unwrap();
    assert_eq!(a.objects_allocated(), 0);

    assert!(a.trim());
    assert_eq!(a.footprint(), before);
    assert!(!a.trim());
    assert!(backing.released_bytes() > 0);
    assert!(matches!(
        backing.events().last(),
        Some(BackingEvent::Shrink { addr: BASE, .. })
    ));
}

#[test]
fn revoking_twice_is_a_no_op() {
    let a = allocator(PageReleaseMode::All);
    let mut rng = XorShift64::new(7);
    for t in 0..4 {
        for _ in 0..200 {
            a.allocate(MutatorId(t), rng.gen_range(1, 176)).unwrap();
        }
    }
    assert!(a.revoke_all_thread_local_runs().unwrap() > 0);
    let census = a.run_census();
    let metrics = a.metrics();
    assert_eq!(a.revoke_all_thread_local_runs().unwrap(), 0);
    assert_eq!(a.run_census(), census);
    assert_eq!(a.metrics().runs_revoked, metrics.runs_revoked);
}

#[test]
fn detached_thread_runs_become_shared() {
    let a = allocator(PageReleaseMode::None);
    let kept = a.allocate(MutatorId(5), 64).unwrap();
    assert_eq!(a.detach_thread(MutatorId(5)).unwrap(), 1);
    assert_eq!(a.detach_thread(MutatorId(5)).unwrap(), 0);
    assert_eq!(a.run_census().non_full, 1);
    // Another thread picks the partially used run back up.
    let next = a.allocate(MutatorId(6), 64).unwrap();
    assert_eq!(next.addr, kept.addr + 64);
}

#[test]
fn invalid_frees_do_not_disturb_state() {
    let a = allocator(PageReleaseMode::None);
    let obj = a.allocate(T1, 300).unwrap();
    let big = a.allocate(T1, 10_000).unwrap();
    for bad in [obj.addr + 1, big.addr + 4096, BASE + 15 * MIB] {
        assert!(matches!(a.free(T1, bad), Err(AllocError::InvalidFree { .. })));
    }
    assert!(a.bulk_free(T1, &[obj.addr, obj.addr + 16]).is_err());
    assert_eq!(a.objects_allocated(), 2);
    assert_eq!(a.usable_size(big.addr).unwrap(), 12_288);
}

#[test]
fn geometry_holds_for_every_page_size() {
    for page_size in [2048, 4096, 8192, 16384, 65536] {
        let table = SizeClassTable::new(page_size).unwrap();
        for (idx, layout) in table.iter().enumerate() {
            assert_eq!(layout.bracket_size, size_class::bracket_size(idx));
            assert_eq!(
                layout.header_size + layout.num_slots * layout.bracket_size,
                layout.run_bytes(page_size)
            );
            assert!(layout.thread_local_free_bitmap_offset > layout.bulk_free_bitmap_offset);
        }
    }
}

#[test]
fn config_from_lookup_feeds_allocator() {
    let config = RosAllocConfig::from_lookup(|key| match key {
        "ROSALLOC_PAGE_SIZE" => Some("8192".into()),
        "ROSALLOC_PAGE_RELEASE_MODE" => Some("end".into()),
        _ => None,
    })
    .unwrap();
    let a = RosAlloc::new(BASE, 16 * MIB, config).unwrap();
    let obj = a.allocate(T1, 3000).unwrap();
    assert_eq!(obj.bytes_charged, 8192);
    assert!(!a.does_release_all_pages());
}
