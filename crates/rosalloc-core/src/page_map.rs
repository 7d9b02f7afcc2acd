//! Page map and region manager.
//!
//! The region is a contiguous range of logical addresses starting at a
//! page-aligned `base`. Pages below `footprint` are backed; `capacity` is the
//! current limit on the footprint and `reserved` the hard ceiling.
//!
//! The page map is the single source of truth for page ownership: runs and
//! large objects are keyed by their starting page index. Free pages are kept
//! as coalesced, address-ordered free page runs.

use crate::error::AllocError;
use crate::release::{PageBacking, PageReleaseMode};
use crate::run::Run;
use crate::size_class::BracketLayout;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

/// Magic tag of a free page run.
pub const FREE_PAGE_RUN_MAGIC: u8 = 43;

/// Ownership tag of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMapKind {
    Empty,
    RunStart,
    RunPart,
    LargeObjectStart,
    LargeObjectPart,
}

/// What owns a looked-up address.
#[derive(Debug, Clone)]
pub enum PageOwner {
    Run(Arc<Run>),
    LargeObject { addr: usize, bytes: usize },
}

/// Pages handed out by [`Region::allocate_pages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGrant {
    pub page_idx: usize,
    pub addr: usize,
    /// Bytes the footprint grew by to satisfy the request.
    pub grew_bytes: usize,
}

/// Result of returning pages to the free pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreedPages {
    pub bytes: usize,
    /// Bytes of the coalesced free run passed to the backing release hook.
    pub released_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct FreePageRun {
    magic: u8,
    num_pages: usize,
}

impl FreePageRun {
    fn new(num_pages: usize) -> Self {
        Self {
            magic: FREE_PAGE_RUN_MAGIC,
            num_pages,
        }
    }
}

#[derive(Debug)]
struct RegionState {
    footprint: usize,
    capacity: usize,
    page_map: Vec<PageMapKind>,
    free_page_runs: BTreeMap<usize, FreePageRun>,
    runs: HashMap<usize, Arc<Run>>,
}

pub struct Region {
    base: usize,
    page_size: usize,
    reserved: usize,
    release_mode: PageReleaseMode,
    release_threshold: usize,
    backing: Arc<dyn PageBacking>,
    state: RwLock<RegionState>,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("page_size", &self.page_size)
            .field("reserved", &self.reserved)
            .field("release_mode", &self.release_mode)
            .finish_non_exhaustive()
    }
}

impl Region {
    /// Creates an empty region. `capacity` is the initial footprint limit,
    /// `reserved` the ceiling that [`Region::set_footprint_limit`] may raise it to.
    pub fn new(
        base: usize,
        page_size: usize,
        capacity: usize,
        reserved: usize,
        release_mode: PageReleaseMode,
        release_threshold: usize,
        backing: Arc<dyn PageBacking>,
    ) -> Result<Self, AllocError> {
        if base % page_size != 0 {
            return Err(AllocError::InvalidConfig(format!(
                "region base {base:#x} is not aligned to {page_size}-byte pages"
            )));
        }
        if capacity > reserved {
            return Err(AllocError::InvalidConfig(format!(
                "capacity {capacity} exceeds reserved size {reserved}"
            )));
        }
        let reserved = reserved - reserved % page_size;
        if reserved == 0 || base.checked_add(reserved).is_none() {
            return Err(AllocError::InvalidConfig(format!(
                "reserved size {reserved} at {base:#x} is empty or overflows"
            )));
        }
        Ok(Self {
            base,
            page_size,
            reserved,
            release_mode,
            release_threshold,
            backing,
            state: RwLock::new(RegionState {
                footprint: 0,
                capacity: capacity - capacity % page_size,
                page_map: vec![PageMapKind::Empty; reserved / page_size],
                free_page_runs: BTreeMap::new(),
                runs: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub fn release_mode(&self) -> PageReleaseMode {
        self.release_mode
    }

    #[must_use]
    pub fn footprint(&self) -> usize {
        self.state.read().footprint
    }

    #[must_use]
    pub fn footprint_limit(&self) -> usize {
        self.state.read().capacity
    }

    /// Raises the footprint limit to `bytes` rounded up to whole pages,
    /// clamped to the reserved size. Never lowers it. Returns the new limit.
    pub fn set_footprint_limit(&self, bytes: usize) -> usize {
        let target = bytes
            .checked_next_multiple_of(self.page_size)
            .unwrap_or(self.reserved)
            .min(self.reserved);
        let mut st = self.state.write();
        if target > st.capacity {
            st.capacity = target;
        }
        st.capacity
    }

    fn page_addr(&self, page_idx: usize) -> usize {
        self.base + page_idx * self.page_size
    }

    /// Carves `count` pages, first-fit over the free page runs, growing the
    /// footprint when nothing fits.
    pub fn allocate_pages(&self, count: usize) -> Result<PageGrant, AllocError> {
        let mut st = self.state.write();
        self.allocate_locked(
            &mut st,
            count,
            PageMapKind::LargeObjectStart,
            PageMapKind::LargeObjectPart,
        )
    }

    /// Carves pages for a fresh run of the given bracket and registers it.
    pub fn allocate_run(
        &self,
        bracket_idx: usize,
        layout: &BracketLayout,
    ) -> Result<(Arc<Run>, PageGrant), AllocError> {
        let mut st = self.state.write();
        let grant = self.allocate_locked(
            &mut st,
            layout.num_pages,
            PageMapKind::RunStart,
            PageMapKind::RunPart,
        )?;
        let run = Arc::new(Run::new(bracket_idx, grant.page_idx, grant.addr, *layout));
        st.runs.insert(grant.page_idx, Arc::clone(&run));
        Ok((run, grant))
    }

    fn allocate_locked(
        &self,
        st: &mut RegionState,
        count: usize,
        start_kind: PageMapKind,
        part_kind: PageMapKind,
    ) -> Result<PageGrant, AllocError> {
        debug_assert!(count > 0);
        let fit = st
            .free_page_runs
            .iter()
            .find(|(_, fpr)| fpr.num_pages >= count)
            .map(|(&idx, fpr)| (idx, fpr.num_pages));

        let (page_idx, grew_bytes) = if let Some((idx, len)) = fit {
            st.free_page_runs.remove(&idx);
            if len > count {
                st.free_page_runs
                    .insert(idx + count, FreePageRun::new(len - count));
            }
            (idx, 0)
        } else {
            // Extend the tail free run, if any, by the shortfall.
            let footprint_pages = st.footprint / self.page_size;
            let tail = st
                .free_page_runs
                .last_key_value()
                .filter(|(idx, fpr)| **idx + fpr.num_pages == footprint_pages)
                .map(|(&idx, fpr)| (idx, fpr.num_pages));
            let (start, have) = tail.unwrap_or((footprint_pages, 0));
            let out_of_memory = AllocError::OutOfMemory {
                requested: count.saturating_mul(self.page_size),
                footprint: st.footprint,
                capacity: st.capacity,
            };
            let Some(grow) = (count - have).checked_mul(self.page_size) else {
                return Err(out_of_memory);
            };
            let new_footprint = st
                .footprint
                .checked_add(grow)
                .filter(|&fp| fp <= st.capacity)
                .ok_or(out_of_memory)?;
            if tail.is_some() {
                st.free_page_runs.remove(&start);
            }
            self.backing.grow(self.page_addr(footprint_pages), grow);
            st.footprint = new_footprint;
            (start, grow)
        };

        st.page_map[page_idx] = start_kind;
        st.page_map[page_idx + 1..page_idx + count].fill(part_kind);
        Ok(PageGrant {
            page_idx,
            addr: self.page_addr(page_idx),
            grew_bytes,
        })
    }

    fn free_locked(&self, st: &mut RegionState, start: usize, count: usize) -> FreedPages {
        st.page_map[start..start + count].fill(PageMapKind::Empty);

        let mut idx = start;
        let mut len = count;
        if let Some(next) = st.free_page_runs.remove(&(idx + len)) {
            debug_assert_eq!(next.magic, FREE_PAGE_RUN_MAGIC);
            len += next.num_pages;
        }
        let prev = st
            .free_page_runs
            .range(..idx)
            .next_back()
            .filter(|(pidx, fpr)| **pidx + fpr.num_pages == idx)
            .map(|(&pidx, fpr)| (pidx, fpr.num_pages));
        if let Some((pidx, plen)) = prev {
            st.free_page_runs.remove(&pidx);
            idx = pidx;
            len += plen;
        }
        st.free_page_runs.insert(idx, FreePageRun::new(len));

        let bytes = len * self.page_size;
        let at_end = (idx + len) * self.page_size == st.footprint;
        let released_bytes =
            if self
                .release_mode
                .should_release(bytes, self.release_threshold, at_end)
            {
                self.backing.release(self.page_addr(idx), bytes);
                bytes
            } else {
                0
            };
        FreedPages {
            bytes: count * self.page_size,
            released_bytes,
        }
    }

    /// Returns a run's pages to the free pool.
    pub fn free_run(&self, run: &Run) -> Result<FreedPages, AllocError> {
        run.check_magic()?;
        let mut st = self.state.write();
        let page = run.page_idx();
        if st.page_map.get(page) != Some(&PageMapKind::RunStart) || st.runs.remove(&page).is_none()
        {
            return Err(AllocError::Corruption {
                page,
                detail: format!("run at {:#x} is not registered", run.base()),
            });
        }
        Ok(self.free_locked(&mut st, page, run.layout().num_pages))
    }

    /// Frees the large object starting at `addr`.
    pub fn free_large_object(&self, addr: usize) -> Result<FreedPages, AllocError> {
        let mut st = self.state.write();
        let page = self.page_of(&st, addr)?;
        if addr % self.page_size != 0 || st.page_map[page] != PageMapKind::LargeObjectStart {
            return Err(AllocError::InvalidFree {
                addr,
                reason: "not the start of a large object",
            });
        }
        let span = Self::large_span(&st, page);
        Ok(self.free_locked(&mut st, page, span))
    }

    fn page_of(&self, st: &RegionState, addr: usize) -> Result<usize, AllocError> {
        if addr < self.base || addr >= self.base + st.footprint {
            return Err(AllocError::InvalidFree {
                addr,
                reason: "outside the allocated footprint",
            });
        }
        Ok((addr - self.base) / self.page_size)
    }

    fn large_span(st: &RegionState, page: usize) -> usize {
        1 + st.page_map[page + 1..]
            .iter()
            .take_while(|kind| **kind == PageMapKind::LargeObjectPart)
            .count()
    }

    /// Finds the run or large object containing `addr`.
    pub fn lookup(&self, addr: usize) -> Result<PageOwner, AllocError> {
        let st = self.state.read();
        let page = self.page_of(&st, addr)?;
        match st.page_map[page] {
            PageMapKind::Empty => Err(AllocError::InvalidFree {
                addr,
                reason: "address is in a free page",
            }),
            PageMapKind::LargeObjectPart => Err(AllocError::InvalidFree {
                addr,
                reason: "interior pointer of a large object",
            }),
            PageMapKind::LargeObjectStart => {
                if addr % self.page_size != 0 {
                    return Err(AllocError::InvalidFree {
                        addr,
                        reason: "interior pointer of a large object",
                    });
                }
                Ok(PageOwner::LargeObject {
                    addr,
                    bytes: Self::large_span(&st, page) * self.page_size,
                })
            }
            PageMapKind::RunStart | PageMapKind::RunPart => {
                let start = (0..=page)
                    .rev()
                    .find(|&p| st.page_map[p] == PageMapKind::RunStart)
                    .ok_or_else(|| AllocError::Corruption {
                        page,
                        detail: "run part without a run start".into(),
                    })?;
                let run = st.runs.get(&start).ok_or_else(|| AllocError::Corruption {
                    page: start,
                    detail: "run start without a registered run".into(),
                })?;
                debug_assert!(run.check_magic().is_ok());
                Ok(PageOwner::Run(Arc::clone(run)))
            }
        }
    }

    /// Gives the tail free page run back to the backing and shrinks the
    /// footprint. Returns the bytes trimmed, if any.
    pub fn trim(&self) -> Option<usize> {
        let mut st = self.state.write();
        let footprint_pages = st.footprint / self.page_size;
        let (idx, fpr) = st
            .free_page_runs
            .last_key_value()
            .filter(|(idx, fpr)| **idx + fpr.num_pages == footprint_pages)
            .map(|(&idx, fpr)| (idx, *fpr))?;
        st.free_page_runs.remove(&idx);
        let bytes = fpr.num_pages * self.page_size;
        st.footprint -= bytes;
        self.backing.shrink(self.page_addr(idx), bytes);
        Some(bytes)
    }

    /// Visits free page runs, large objects, and every run slot as
    /// `(start, end, used_bytes)` in address order.
    ///
    /// The region lock is held for reading throughout; `visitor` must not
    /// call back into the allocator.
    pub fn inspect(&self, visitor: &mut dyn FnMut(usize, usize, usize)) {
        let st = self.state.read();
        let footprint_pages = st.footprint / self.page_size;
        let mut page = 0;
        while page < footprint_pages {
            let addr = self.page_addr(page);
            let span = match st.page_map[page] {
                PageMapKind::Empty => {
                    let len = st.free_page_runs.get(&page).map_or(1, |fpr| fpr.num_pages);
                    visitor(addr, addr + len * self.page_size, 0);
                    len
                }
                PageMapKind::LargeObjectStart => {
                    let len = Self::large_span(&st, page);
                    let bytes = len * self.page_size;
                    visitor(addr, addr + bytes, bytes);
                    len
                }
                PageMapKind::RunStart => match st.runs.get(&page) {
                    Some(run) => {
                        run.inspect_slots(visitor);
                        run.layout().num_pages
                    }
                    None => 1,
                },
                PageMapKind::RunPart | PageMapKind::LargeObjectPart => 1,
            };
            page += span;
        }
    }

    /// Free page runs as `(addr, bytes)` in address order.
    #[must_use]
    pub fn free_page_runs(&self) -> Vec<(usize, usize)> {
        self.state
            .read()
            .free_page_runs
            .iter()
            .map(|(&idx, fpr)| (self.page_addr(idx), fpr.num_pages * self.page_size))
            .collect()
    }

    /// Number of live runs.
    #[must_use]
    pub fn num_runs(&self) -> usize {
        self.state.read().runs.len()
    }

    /// One line per page below the footprint.
    #[must_use]
    pub fn dump_page_map(&self) -> String {
        let st = self.state.read();
        let footprint_pages = st.footprint / self.page_size;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "region {:#x} footprint={} limit={} reserved={} pages={}",
            self.base, st.footprint, st.capacity, self.reserved, footprint_pages
        );
        let mut remaining_free = 0;
        for (page, kind) in st.page_map[..footprint_pages].iter().enumerate() {
            let _ = write!(out, "  {page}: {kind:?}");
            match kind {
                PageMapKind::Empty => {
                    if let Some(fpr) = st.free_page_runs.get(&page) {
                        let _ = write!(out, " (free page run: {} pages)", fpr.num_pages);
                        remaining_free = fpr.num_pages;
                    } else if remaining_free == 0 {
                        let _ = write!(out, " (untracked)");
                    }
                    remaining_free = remaining_free.saturating_sub(1);
                }
                PageMapKind::RunStart => {
                    if let Some(run) = st.runs.get(&page) {
                        let _ = write!(
                            out,
                            " (bracket {} = {} bytes)",
                            run.bracket_idx(),
                            run.bracket_size()
                        );
                    }
                }
                _ => {}
            }
            out.push('\n');
        }
        out
    }
}
