//! Runs: one or more contiguous pages sliced into equal slots.
//!
//! Each run carries three bitmaps of `num_slots` bits:
//! - allocation (1 = slot in use),
//! - bulk-free (collector marks, merged under the bracket lock),
//! - thread-local-free (frees by non-owners of a thread-local run).
//!
//! Pending marks are only ever subtracted from the allocation bitmap.
//! Slots at or above the bump cursor `top_slot_idx` are always free.
//!
//! Bitmap words are atomics so that marks from other threads never tear, but
//! the allocation bitmap and cursor have a single writer at a time: the
//! owning thread for a thread-local run, the bracket lock holder otherwise.

use crate::error::AllocError;
use crate::size_class::{BracketLayout, RUN_FIXED_HEADER_SIZE};
use crate::thread_cache::MutatorId;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Magic tag stored in every live run.
pub const RUN_MAGIC: u8 = 42;

const NO_OWNER: u64 = MutatorId::RESERVED.0;
const WORD_BITS: usize = u32::BITS as usize;

#[derive(Debug)]
pub struct Run {
    magic: u8,
    bracket_idx: u8,
    page_idx: usize,
    base: usize,
    layout: BracketLayout,
    is_thread_local: AtomicBool,
    owner: AtomicU64,
    to_be_bulk_freed: AtomicBool,
    top_slot_idx: AtomicU32,
    /// Allocation, bulk-free, and thread-local-free bitmaps back to back.
    bitmaps: Box<[AtomicU32]>,
}

#[derive(Clone, Copy)]
enum Bitmap {
    Alloc,
    BulkFree,
    ThreadLocalFree,
}

impl Run {
    /// Creates an empty run over fresh pages starting at `base`.
    #[must_use]
    pub fn new(bracket_idx: usize, page_idx: usize, base: usize, layout: BracketLayout) -> Self {
        let words = layout.bitmap_words();
        debug_assert_eq!(
            (layout.bulk_free_bitmap_offset - RUN_FIXED_HEADER_SIZE) / 4,
            words
        );
        Self {
            magic: RUN_MAGIC,
            bracket_idx: bracket_idx as u8,
            page_idx,
            base,
            layout,
            is_thread_local: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            to_be_bulk_freed: AtomicBool::new(false),
            top_slot_idx: AtomicU32::new(0),
            bitmaps: (0..words * 3).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[must_use]
    pub fn bracket_idx(&self) -> usize {
        usize::from(self.bracket_idx)
    }

    #[must_use]
    pub fn bracket_size(&self) -> usize {
        self.layout.bracket_size
    }

    /// First page of the run in the region.
    #[must_use]
    pub fn page_idx(&self) -> usize {
        self.page_idx
    }

    /// Address of the run header.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn layout(&self) -> &BracketLayout {
        &self.layout
    }

    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.layout.num_slots
    }

    #[must_use]
    pub fn top_slot_idx(&self) -> usize {
        self.top_slot_idx.load(Ordering::Acquire) as usize
    }

    /// Verifies the run's magic tag.
    pub fn check_magic(&self) -> Result<(), AllocError> {
        if self.magic == RUN_MAGIC {
            Ok(())
        } else {
            Err(AllocError::Corruption {
                page: self.page_idx,
                detail: format!("run magic {} != {RUN_MAGIC}", self.magic),
            })
        }
    }

    #[must_use]
    pub fn is_thread_local(&self) -> bool {
        self.is_thread_local.load(Ordering::Acquire)
    }

    /// Thread currently holding the run as its thread-local run.
    #[must_use]
    pub fn owner(&self) -> Option<MutatorId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(MutatorId(id)),
        }
    }

    /// Claims the run for `owner`, or releases it to shared ownership.
    pub fn set_thread_local(&self, owner: Option<MutatorId>) {
        self.owner
            .store(owner.map_or(NO_OWNER, |id| id.0), Ordering::Release);
        self.is_thread_local.store(owner.is_some(), Ordering::Release);
    }

    #[must_use]
    pub fn to_be_bulk_freed(&self) -> bool {
        self.to_be_bulk_freed.load(Ordering::Acquire)
    }

    pub fn set_to_be_bulk_freed(&self, pending: bool) {
        self.to_be_bulk_freed.store(pending, Ordering::Release);
    }

    fn word(&self, map: Bitmap, w: usize) -> &AtomicU32 {
        let words = self.layout.bitmap_words();
        let start = match map {
            Bitmap::Alloc => 0,
            Bitmap::BulkFree => words,
            Bitmap::ThreadLocalFree => 2 * words,
        };
        &self.bitmaps[start + w]
    }

    /// Mask of the bits in word `w` that correspond to real slots.
    fn valid_mask(&self, w: usize) -> u32 {
        let remaining = self.layout.num_slots - w * WORD_BITS;
        if remaining >= WORD_BITS {
            u32::MAX
        } else {
            (1u32 << remaining) - 1
        }
    }

    fn test_bit(&self, map: Bitmap, idx: usize) -> bool {
        self.word(map, idx / WORD_BITS).load(Ordering::Acquire) & (1 << (idx % WORD_BITS)) != 0
    }

    /// Address of slot `idx`.
    #[must_use]
    pub fn slot_addr(&self, idx: usize) -> usize {
        self.base + self.layout.slot_offset(idx)
    }

    /// Slot index of `addr`, which must be a slot start inside this run.
    pub fn slot_index(&self, addr: usize) -> Result<usize, AllocError> {
        let first = self.slot_addr(0);
        let offset = addr
            .checked_sub(first)
            .ok_or(AllocError::InvalidFree { addr, reason: "address inside run header" })?;
        if offset % self.layout.bracket_size != 0 {
            return Err(AllocError::InvalidFree { addr, reason: "not a slot start" });
        }
        let idx = offset / self.layout.bracket_size;
        if idx >= self.layout.num_slots {
            return Err(AllocError::InvalidFree { addr, reason: "beyond last slot" });
        }
        Ok(idx)
    }

    /// Checks that `addr` is allocated with no free mark pending.
    pub fn check_live(&self, addr: usize) -> Result<usize, AllocError> {
        let idx = self.slot_index(addr)?;
        if !self.test_bit(Bitmap::Alloc, idx) {
            return Err(AllocError::InvalidFree { addr, reason: "slot is not allocated" });
        }
        if self.test_bit(Bitmap::BulkFree, idx) || self.test_bit(Bitmap::ThreadLocalFree, idx) {
            return Err(AllocError::InvalidFree { addr, reason: "slot already freed" });
        }
        Ok(idx)
    }

    /// Allocates one slot, bumping the cursor while untouched slots remain.
    ///
    /// Returns `None` when the run is full.
    pub fn alloc_slot(&self) -> Option<usize> {
        let top = self.top_slot_idx();
        if top < self.layout.num_slots {
            let mask = 1 << (top % WORD_BITS);
            self.word(Bitmap::Alloc, top / WORD_BITS)
                .fetch_or(mask, Ordering::AcqRel);
            self.top_slot_idx.store(top as u32 + 1, Ordering::Release);
            return Some(self.slot_addr(top));
        }
        for w in 0..self.layout.bitmap_words() {
            let word = self.word(Bitmap::Alloc, w);
            let free = !word.load(Ordering::Acquire) & self.valid_mask(w);
            if free != 0 {
                let bit = free.trailing_zeros() as usize;
                word.fetch_or(1 << bit, Ordering::AcqRel);
                return Some(self.slot_addr(w * WORD_BITS + bit));
            }
        }
        None
    }

    /// Clears the allocation bit of `addr`.
    ///
    /// Freeing the slot just below the cursor rolls the cursor back over
    /// every trailing free slot.
    pub fn free_slot(&self, addr: usize) -> Result<(), AllocError> {
        let idx = self.check_live(addr)?;
        let mask = 1 << (idx % WORD_BITS);
        self.word(Bitmap::Alloc, idx / WORD_BITS)
            .fetch_and(!mask, Ordering::AcqRel);

        let mut top = self.top_slot_idx();
        if idx + 1 == top {
            while top > 0 && !self.test_bit(Bitmap::Alloc, top - 1) {
                top -= 1;
            }
            self.top_slot_idx.store(top as u32, Ordering::Release);
        }
        Ok(())
    }

    /// Marks `addr` for the next bulk-free merge.
    pub fn mark_bulk_free(&self, addr: usize) -> Result<(), AllocError> {
        let idx = self.check_live(addr)?;
        self.word(Bitmap::BulkFree, idx / WORD_BITS)
            .fetch_or(1 << (idx % WORD_BITS), Ordering::AcqRel);
        Ok(())
    }

    /// Marks `addr` as freed by a thread other than the run's owner.
    pub fn mark_thread_local_free(&self, addr: usize) -> Result<(), AllocError> {
        let idx = self.check_live(addr)?;
        self.word(Bitmap::ThreadLocalFree, idx / WORD_BITS)
            .fetch_or(1 << (idx % WORD_BITS), Ordering::AcqRel);
        Ok(())
    }

    /// Subtracts the bulk-free bitmap from the allocation bitmap and clears
    /// it. Returns whether the run is now completely free.
    pub fn merge_bulk_free_into_alloc(&self) -> bool {
        self.subtract_into_alloc(Bitmap::BulkFree);
        self.is_all_free()
    }

    /// Subtracts the thread-local-free bitmap from the allocation bitmap and
    /// clears it. Returns `(any_slot_freed, all_free_after)`.
    pub fn merge_thread_local_free_into_alloc(&self) -> (bool, bool) {
        let changed = self.subtract_into_alloc(Bitmap::ThreadLocalFree);
        (changed, self.is_all_free())
    }

    fn subtract_into_alloc(&self, map: Bitmap) -> bool {
        let mut changed = false;
        for w in 0..self.layout.bitmap_words() {
            let marks = self.word(map, w).swap(0, Ordering::AcqRel);
            if marks != 0 {
                self.word(Bitmap::Alloc, w)
                    .fetch_and(!marks, Ordering::AcqRel);
                changed = true;
            }
        }
        changed
    }

    /// Moves pending bulk-free marks to the thread-local-free bitmap, for
    /// runs still owned by a thread. The owner merges them later.
    pub fn union_bulk_free_into_thread_local(&self) {
        for w in 0..self.layout.bitmap_words() {
            let marks = self.word(Bitmap::BulkFree, w).swap(0, Ordering::AcqRel);
            if marks != 0 {
                self.word(Bitmap::ThreadLocalFree, w)
                    .fetch_or(marks, Ordering::AcqRel);
            }
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.top_slot_idx() >= self.layout.num_slots
            && (0..self.layout.bitmap_words())
                .all(|w| self.word(Bitmap::Alloc, w).load(Ordering::Acquire) == self.valid_mask(w))
    }

    #[must_use]
    pub fn is_all_free(&self) -> bool {
        (0..self.layout.bitmap_words())
            .all(|w| self.word(Bitmap::Alloc, w).load(Ordering::Acquire) == 0)
    }

    /// Slots allocated with no free mark pending.
    #[must_use]
    pub fn live_slots(&self) -> usize {
        (0..self.layout.bitmap_words())
            .map(|w| {
                let alloc = self.word(Bitmap::Alloc, w).load(Ordering::Acquire);
                let pending = self.word(Bitmap::BulkFree, w).load(Ordering::Acquire)
                    | self.word(Bitmap::ThreadLocalFree, w).load(Ordering::Acquire);
                (alloc & !pending).count_ones() as usize
            })
            .sum()
    }

    /// Visits every slot as `(start, end, used_bytes)`; free slots and slots
    /// with a pending free mark report zero used bytes.
    pub fn inspect_slots(&self, visitor: &mut dyn FnMut(usize, usize, usize)) {
        let size = self.layout.bracket_size;
        for idx in 0..self.layout.num_slots {
            let live = self.test_bit(Bitmap::Alloc, idx)
                && !self.test_bit(Bitmap::BulkFree, idx)
                && !self.test_bit(Bitmap::ThreadLocalFree, idx);
            let start = self.slot_addr(idx);
            visitor(start, start + size, if live { size } else { 0 });
        }
    }

    /// Human-readable header and bitmap dump.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Run@{:#x} magic={} bracket={} ({} bytes) pages={} slots={} top={} \
             thread_local={} owner={:?} to_be_bulk_freed={}",
            self.base,
            self.magic,
            self.bracket_idx,
            self.layout.bracket_size,
            self.layout.num_pages,
            self.layout.num_slots,
            self.top_slot_idx(),
            self.is_thread_local(),
            self.owner().map(|id| id.0),
            self.to_be_bulk_freed(),
        );
        for (name, map) in [
            ("alloc", Bitmap::Alloc),
            ("bulk", Bitmap::BulkFree),
            ("tl", Bitmap::ThreadLocalFree),
        ] {
            let _ = write!(out, "  {name:>5}:");
            for w in 0..self.layout.bitmap_words() {
                let _ = write!(out, " {:08x}", self.word(map, w).load(Ordering::Acquire));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SizeClassTable;

    fn run_for(idx: usize) -> Run {
        let table = SizeClassTable::new(4096).unwrap();
        Run::new(idx, 3, 0x3000, *table.layout(idx))
    }

    #[test]
    fn bump_then_scan() {
        let run = run_for(1);
        let a = run.alloc_slot().unwrap();
        let b = run.alloc_slot().unwrap();
        assert_eq!(a, 0x3000 + 64);
        assert_eq!(b, a + 32);
        assert_eq!(run.top_slot_idx(), 2);

        // Freeing below the top slot leaves a hole the scan finds after the bump runs out.
        let c = run.alloc_slot().unwrap();
        run.free_slot(a).unwrap();
        assert_eq!(run.top_slot_idx(), 3);
        while run.top_slot_idx() < run.num_slots() {
            run.alloc_slot().unwrap();
        }
        assert_eq!(run.alloc_slot(), Some(a));
        assert!(run.is_full());
        assert_eq!(run.alloc_slot(), None);
        assert!(c > b);
    }

    #[test]
    fn free_top_slot_rolls_cursor_back() {
        let run = run_for(0);
        let a = run.alloc_slot().unwrap();
        let b = run.alloc_slot().unwrap();
        let c = run.alloc_slot().unwrap();
        run.free_slot(b).unwrap();
        assert_eq!(run.top_slot_idx(), 3);
        run.free_slot(c).unwrap();
        assert_eq!(run.top_slot_idx(), 1);
        assert_eq!(run.alloc_slot(), Some(b));
        run.free_slot(b).unwrap();
        run.free_slot(a).unwrap();
        assert_eq!(run.top_slot_idx(), 0);
        assert!(run.is_all_free());
    }

    #[test]
    fn rejects_bad_frees() {
        let run = run_for(2);
        let a = run.alloc_slot().unwrap();
        assert!(matches!(
            run.free_slot(a + 8),
            Err(AllocError::InvalidFree { reason: "not a slot start", .. })
        ));
        assert!(matches!(
            run.free_slot(0x3000),
            Err(AllocError::InvalidFree { reason: "address inside run header", .. })
        ));
        assert!(matches!(
            run.free_slot(a + 48),
            Err(AllocError::InvalidFree { reason: "slot is not allocated", .. })
        ));
        run.free_slot(a).unwrap();
        assert!(run.free_slot(a).is_err());
    }

    #[test]
    fn bulk_merge_reports_all_free() {
        let run = run_for(3);
        let addrs: Vec<usize> = (0..10).map(|_| run.alloc_slot().unwrap()).collect();
        for &a in &addrs[..9] {
            run.mark_bulk_free(a).unwrap();
        }
        assert!(run.mark_bulk_free(addrs[0]).is_err(), "double mark");
        assert_eq!(run.live_slots(), 1);
        assert!(!run.merge_bulk_free_into_alloc());
        run.mark_bulk_free(addrs[9]).unwrap();
        assert!(run.merge_bulk_free_into_alloc());
        assert!(run.is_all_free());
    }

    #[test]
    fn thread_local_marks_merge_lazily() {
        let run = run_for(0);
        run.set_thread_local(Some(MutatorId(7)));
        assert_eq!(run.owner(), Some(MutatorId(7)));
        let a = run.alloc_slot().unwrap();
        let b = run.alloc_slot().unwrap();
        run.mark_thread_local_free(a).unwrap();
        assert!(run.check_live(a).is_err());
        assert_eq!(run.merge_thread_local_free_into_alloc(), (true, false));
        assert_eq!(run.merge_thread_local_free_into_alloc(), (false, false));

        run.mark_bulk_free(b).unwrap();
        run.union_bulk_free_into_thread_local();
        assert!(!run.is_all_free());
        assert_eq!(run.merge_thread_local_free_into_alloc(), (true, true));

        run.set_thread_local(None);
        assert!(!run.is_thread_local());
        assert_eq!(run.owner(), None);
    }

    #[test]
    fn inspect_reports_pending_marks_as_free() {
        let run = run_for(0);
        let a = run.alloc_slot().unwrap();
        let b = run.alloc_slot().unwrap();
        run.mark_thread_local_free(b).unwrap();
        let mut used = Vec::new();
        run.inspect_slots(&mut |start, end, bytes| {
            assert_eq!(end - start, 16);
            if bytes > 0 {
                used.push(start);
            }
        });
        assert_eq!(used, vec![a]);
    }

    #[test]
    fn dump_lists_bitmaps() {
        let run = run_for(0);
        run.alloc_slot().unwrap();
        let text = run.dump();
        assert!(text.contains("magic=42"));
        assert!(text.contains("alloc: 00000001"));
        run.check_magic().unwrap();
    }
}
