//! Size brackets for small allocations.
//!
//! 34 brackets: 16..=512 bytes in 16-byte steps, then 1 KiB and 2 KiB.
//! Requests above [`LARGE_SIZE_THRESHOLD`] bypass the brackets and are
//! served as whole pages. The per-bracket run geometry is computed once by
//! [`SizeClassTable::new`] and never mutated afterwards.

use crate::error::AllocError;

/// Number of size brackets.
pub const NUM_SIZE_BRACKETS: usize = 34;

/// Number of leading brackets that are [`QUANTUM`] bytes apart.
pub const NUM_QUANTUM_SIZE_BRACKETS: usize = 32;

/// Spacing of the quantum brackets (bytes).
pub const QUANTUM: usize = 16;

/// Largest quantum bracket (bytes).
pub const MAX_QUANTUM_SIZE: usize = QUANTUM * NUM_QUANTUM_SIZE_BRACKETS;

/// Requests larger than this are large objects, allocated at page granularity.
pub const LARGE_SIZE_THRESHOLD: usize = 2048;

/// Brackets `0..=MAX_THREAD_LOCAL_BRACKET_IDX` use thread-local runs; the rest
/// share a per-bracket current run.
pub const MAX_THREAD_LOCAL_BRACKET_IDX: usize = 10;

/// Bytes of run header preceding the allocation bitmap
/// (magic, bracket index, thread-local flag, bulk-free flag, bump cursor).
pub const RUN_FIXED_HEADER_SIZE: usize = 8;

const BITS_PER_WORD: usize = u32::BITS as usize;
const WORD_BYTES: usize = std::mem::size_of::<u32>();

/// Returns the slot size of bracket `idx`.
///
/// Panics if `idx >= NUM_SIZE_BRACKETS`.
#[must_use]
pub const fn bracket_size(idx: usize) -> usize {
    assert!(idx < NUM_SIZE_BRACKETS);
    if idx < NUM_QUANTUM_SIZE_BRACKETS {
        QUANTUM * (idx + 1)
    } else if idx == NUM_SIZE_BRACKETS - 2 {
        1024
    } else {
        2048
    }
}

/// Returns the bracket index for an exact bracket size.
#[must_use]
pub fn bracket_size_to_index(size: usize) -> Option<usize> {
    match size {
        1024 => Some(NUM_SIZE_BRACKETS - 2),
        2048 => Some(NUM_SIZE_BRACKETS - 1),
        s if (QUANTUM..=MAX_QUANTUM_SIZE).contains(&s) && s % QUANTUM == 0 => Some(s / QUANTUM - 1),
        _ => None,
    }
}

/// Rounds `size` up to its bracket size. Zero-byte requests take a 16-byte slot.
///
/// Only defined for `size <= LARGE_SIZE_THRESHOLD`.
#[must_use]
pub fn round_to_bracket_size(size: usize) -> usize {
    size_to_index_and_bracket_size(size).1
}

/// Returns the bracket index for a request of `size` bytes.
///
/// Only defined for `size <= LARGE_SIZE_THRESHOLD`.
#[must_use]
pub fn bracket_index(size: usize) -> usize {
    size_to_index_and_bracket_size(size).0
}

/// Combined [`bracket_index`] and [`round_to_bracket_size`].
#[must_use]
pub fn size_to_index_and_bracket_size(size: usize) -> (usize, usize) {
    debug_assert!(size <= LARGE_SIZE_THRESHOLD);
    if size <= MAX_QUANTUM_SIZE {
        let rounded = size.max(1).next_multiple_of(QUANTUM);
        (rounded / QUANTUM - 1, rounded)
    } else if size <= 1024 {
        (NUM_SIZE_BRACKETS - 2, 1024)
    } else {
        (NUM_SIZE_BRACKETS - 1, 2048)
    }
}

/// Bytes charged for a request of `size` bytes: the bracket size for small
/// requests, whole pages for large ones. Saturates at the largest
/// page-aligned size for requests no region could hold.
#[must_use]
pub fn usable_size_for(size: usize, page_size: usize) -> usize {
    if size > LARGE_SIZE_THRESHOLD {
        size
            .checked_next_multiple_of(page_size)
            .unwrap_or(usize::MAX - usize::MAX % page_size)
    } else {
        round_to_bracket_size(size)
    }
}

/// Pages per run for bracket `idx`.
const fn pages_per_run(idx: usize) -> usize {
    match idx {
        0..=3 => 1,
        4..=7 => 2,
        8..=15 => 4,
        16..=31 => 8,
        32 => 16,
        _ => 32,
    }
}

/// Geometry of a run for one bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketLayout {
    /// Slot size (bytes).
    pub bracket_size: usize,
    /// Pages occupied by one run.
    pub num_pages: usize,
    /// Slots per run.
    pub num_slots: usize,
    /// Bytes before slot 0: fixed header, three bitmaps, alignment padding.
    pub header_size: usize,
    /// Byte offset of the bulk-free bitmap from the run start.
    pub bulk_free_bitmap_offset: usize,
    /// Byte offset of the thread-local-free bitmap from the run start.
    pub thread_local_free_bitmap_offset: usize,
}

impl BracketLayout {
    fn compute(idx: usize, page_size: usize) -> Result<Self, AllocError> {
        let bracket_size = bracket_size(idx);
        let num_pages = pages_per_run(idx);
        let run_bytes = page_size * num_pages;

        // Largest slot count that leaves room for the header and bitmaps.
        for slots in (1..=run_bytes / bracket_size).rev() {
            let bitmap_bytes = slots.next_multiple_of(BITS_PER_WORD) / 8;
            let bulk_off = RUN_FIXED_HEADER_SIZE + bitmap_bytes;
            let tl_off = bulk_off + bitmap_bytes;
            let header = (tl_off + bitmap_bytes).next_multiple_of(bracket_size);
            if header + slots * bracket_size <= run_bytes {
                let layout = Self {
                    bracket_size,
                    num_pages,
                    num_slots: slots,
                    // Absorb the remainder so header + slots fills the run exactly.
                    header_size: header + run_bytes % bracket_size,
                    bulk_free_bitmap_offset: bulk_off,
                    thread_local_free_bitmap_offset: tl_off,
                };
                layout.validate(page_size)?;
                return Ok(layout);
            }
        }
        Err(AllocError::InvalidConfig(format!(
            "bracket {idx} ({bracket_size} bytes) cannot fit a run header in {run_bytes} bytes"
        )))
    }

    fn validate(&self, page_size: usize) -> Result<(), AllocError> {
        let run_bytes = self.run_bytes(page_size);
        let bitmap_bytes = self.bitmap_words() * WORD_BYTES;
        let ok = self.header_size + self.num_slots * self.bracket_size == run_bytes
            && self.bulk_free_bitmap_offset == RUN_FIXED_HEADER_SIZE + bitmap_bytes
            && self.thread_local_free_bitmap_offset == self.bulk_free_bitmap_offset + bitmap_bytes
            && self.thread_local_free_bitmap_offset + bitmap_bytes <= self.header_size;
        if ok {
            Ok(())
        } else {
            Err(AllocError::InvalidConfig(format!(
                "inconsistent run layout for {}-byte bracket: {self:?}",
                self.bracket_size
            )))
        }
    }

    /// 32-bit words in each of the three bitmaps.
    #[must_use]
    pub const fn bitmap_words(&self) -> usize {
        self.num_slots.div_ceil(BITS_PER_WORD)
    }

    /// Total bytes of a run.
    #[must_use]
    pub const fn run_bytes(&self, page_size: usize) -> usize {
        self.num_pages * page_size
    }

    /// Byte offset of `slot` from the run start.
    #[must_use]
    pub const fn slot_offset(&self, slot: usize) -> usize {
        self.header_size + slot * self.bracket_size
    }
}

/// Immutable per-bracket geometry, built once per allocator.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    page_size: usize,
    layouts: Vec<BracketLayout>,
}

impl SizeClassTable {
    /// Computes the geometry of every bracket for `page_size`.
    pub fn new(page_size: usize) -> Result<Self, AllocError> {
        if !page_size.is_power_of_two() || page_size < LARGE_SIZE_THRESHOLD {
            return Err(AllocError::InvalidConfig(format!(
                "page size {page_size} must be a power of two >= {LARGE_SIZE_THRESHOLD}"
            )));
        }
        let layouts = (0..NUM_SIZE_BRACKETS)
            .map(|idx| BracketLayout::compute(idx, page_size))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { page_size, layouts })
    }

    /// Page size the table was built for.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Geometry of bracket `idx`.
    #[must_use]
    pub fn layout(&self, idx: usize) -> &BracketLayout {
        &self.layouts[idx]
    }

    /// All bracket layouts in index order.
    pub fn iter(&self) -> impl Iterator<Item = &BracketLayout> {
        self.layouts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracket_index_min() {
        assert_eq!(bracket_index(0), 0);
        assert_eq!(bracket_index(1), 0);
        assert_eq!(bracket_index(16), 0);
    }

    #[test]
    fn bracket_index_round_up() {
        assert_eq!(size_to_index_and_bracket_size(17), (1, 32));
        assert_eq!(size_to_index_and_bracket_size(24), (1, 32));
        assert_eq!(size_to_index_and_bracket_size(512), (31, 512));
        assert_eq!(size_to_index_and_bracket_size(513), (32, 1024));
        assert_eq!(size_to_index_and_bracket_size(1024), (32, 1024));
        assert_eq!(size_to_index_and_bracket_size(1025), (33, 2048));
        assert_eq!(size_to_index_and_bracket_size(2048), (33, 2048));
    }

    #[test]
    fn bracket_size_roundtrip() {
        for i in 0..NUM_SIZE_BRACKETS {
            let size = bracket_size(i);
            assert_eq!(bracket_index(size), i);
            assert_eq!(bracket_size_to_index(size), Some(i));
        }
        assert_eq!(bracket_size_to_index(24), None);
        assert_eq!(bracket_size_to_index(768), None);
    }

    #[test]
    fn classification_is_monotonic_and_covering() {
        let mut prev = 0;
        for size in 1..=LARGE_SIZE_THRESHOLD {
            let (idx, rounded) = size_to_index_and_bracket_size(size);
            assert!(idx >= prev, "size {size} mapped below a smaller size");
            assert!(rounded >= size);
            assert_eq!(rounded, bracket_size(idx));
            prev = idx;
        }
    }

    #[test]
    fn usable_size_switches_to_pages_above_threshold() {
        assert_eq!(usable_size_for(2048, 4096), 2048);
        assert_eq!(usable_size_for(2049, 4096), 4096);
        assert_eq!(usable_size_for(3000, 4096), 4096);
        assert_eq!(usable_size_for(4097, 4096), 8192);
        assert_eq!(usable_size_for(usize::MAX - 10, 4096), usize::MAX - 4095);
        assert_eq!(usable_size_for(usize::MAX, 8192), usize::MAX - 8191);
    }

    #[test]
    fn layouts_match_reference_geometry() {
        let table = SizeClassTable::new(4096).unwrap();
        let first = table.layout(0);
        assert_eq!(first.num_pages, 1);
        assert_eq!(first.num_slots, 249);
        assert_eq!(first.header_size, 112);
        assert_eq!(first.bulk_free_bitmap_offset, 40);
        assert_eq!(first.thread_local_free_bitmap_offset, 72);

        let b32 = table.layout(1);
        assert_eq!((b32.num_slots, b32.header_size), (126, 64));

        let b208 = table.layout(12);
        assert_eq!((b208.num_pages, b208.num_slots, b208.header_size), (4, 77, 368));

        let last = table.layout(NUM_SIZE_BRACKETS - 1);
        assert_eq!((last.num_pages, last.num_slots, last.header_size), (32, 63, 2048));
    }

    #[test]
    fn every_run_is_exactly_filled() {
        for page_size in [4096, 8192, 16384, 65536] {
            let table = SizeClassTable::new(page_size).unwrap();
            for layout in table.iter() {
                assert!(layout.num_slots > 0);
                assert_eq!(
                    layout.slot_offset(layout.num_slots),
                    layout.run_bytes(page_size)
                );
                assert_eq!(layout.header_size % 8, 0);
            }
        }
    }

    #[test]
    fn rejects_bad_page_sizes() {
        assert!(SizeClassTable::new(3000).is_err());
        assert!(SizeClassTable::new(1024).is_err());
        assert!(SizeClassTable::new(2048).is_ok());
    }
}
