use kernel_info::memory::NodeId;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, Pfn, align_up};
use log::debug;

use crate::bitmap::PageBitmap;
use crate::bootmem::bootmap_pages;
use crate::error::BootmemError;
use crate::release::{PageSink, ReleaseSummary, release_pfn_range};

/// Bit index of a page relative to the node's first frame.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn bit(idx: u64) -> usize {
    idx as usize
}

#[inline]
const fn pages_up(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

enum NodeState<'m> {
    Active(PageBitmap<'m>),
    Retired,
}

/// Per-node allocator state: the bitmap over `[min_pfn, low_pfn)` and the
/// cursors that speed up consecutive allocations.
pub(crate) struct BootmemNode<'m> {
    nid: NodeId,
    state: NodeState<'m>,
    map_phys: PhysicalAddress,
    min_pfn: Pfn,
    low_pfn: Pfn,
    /// Bit index where the next search starts.
    hint_idx: u64,
    /// Byte offset from the node base just past the last allocation.
    last_end_off: u64,
}

impl<'m> BootmemNode<'m> {
    pub(crate) const fn new(
        nid: NodeId,
        map: PageBitmap<'m>,
        map_phys: PhysicalAddress,
        min_pfn: Pfn,
        low_pfn: Pfn,
    ) -> Self {
        Self {
            nid,
            state: NodeState::Active(map),
            map_phys,
            min_pfn,
            low_pfn,
            hint_idx: 0,
            last_end_off: 0,
        }
    }

    #[inline]
    pub(crate) const fn nid(&self) -> NodeId {
        self.nid
    }

    #[inline]
    pub(crate) const fn min_pfn(&self) -> Pfn {
        self.min_pfn
    }

    #[inline]
    pub(crate) const fn low_pfn(&self) -> Pfn {
        self.low_pfn
    }

    #[inline]
    pub(crate) const fn map_phys(&self) -> PhysicalAddress {
        self.map_phys
    }

    #[inline]
    pub(crate) fn pages(&self) -> u64 {
        self.low_pfn - self.min_pfn
    }

    #[inline]
    pub(crate) const fn is_retired(&self) -> bool {
        matches!(self.state, NodeState::Retired)
    }

    fn map(&self) -> &PageBitmap<'m> {
        match &self.state {
            NodeState::Active(map) => map,
            NodeState::Retired => panic!("bootmem node {} used after release", self.nid),
        }
    }

    fn map_mut(&mut self) -> &mut PageBitmap<'m> {
        match &mut self.state {
            NodeState::Active(map) => map,
            NodeState::Retired => panic!("bootmem node {} used after release", self.nid),
        }
    }

    pub(crate) fn free_pages(&self) -> u64 {
        match &self.state {
            NodeState::Active(map) => map.count_zeros() as u64,
            NodeState::Retired => 0,
        }
    }

    fn check_span(&self, start: Pfn, end: Pfn) {
        assert!(
            self.min_pfn <= start && start <= end && end <= self.low_pfn,
            "bootmem: pfns [{start}, {end}) outside node {} [{}, {})",
            self.nid,
            self.min_pfn,
            self.low_pfn
        );
    }

    pub(crate) fn free_pfns(&mut self, start: Pfn, end: Pfn) {
        self.check_span(start, end);
        self.free_idx(start - self.min_pfn, end - self.min_pfn);
    }

    fn free_idx(&mut self, sidx: u64, eidx: u64) {
        if self.hint_idx > sidx {
            self.hint_idx = sidx;
        }

        let min = self.min_pfn;
        let map = self.map_mut();
        for idx in sidx..eidx {
            assert!(
                map.test_and_clear(bit(idx)),
                "bootmem: freeing page frame {} which is not reserved",
                min + idx
            );
        }
    }

    /// Set the bits for `[start, end)`. An exclusive reservation that hits a
    /// set bit clears what it had set and fails.
    pub(crate) fn reserve_pfns(
        &mut self,
        start: Pfn,
        end: Pfn,
        exclusive: bool,
    ) -> Result<(), BootmemError> {
        self.check_span(start, end);
        let (sidx, eidx) = (start - self.min_pfn, end - self.min_pfn);

        for idx in sidx..eidx {
            if self.map_mut().test_and_set(bit(idx)) {
                let pfn = self.min_pfn + idx;
                if exclusive {
                    self.free_idx(sidx, idx);
                    return Err(BootmemError::Busy { pfn });
                }
                debug!("bootmem: silent double reserve of PFN {pfn}");
            }
        }
        Ok(())
    }

    /// Bit index `idx` moved up so that its page frame is a multiple of `step`.
    #[inline]
    fn align_idx(&self, idx: u64, step: u64) -> u64 {
        let base = self.min_pfn.as_u64();
        align_up(base + idx, step) - base
    }

    /// Byte offset `off` moved up so that its physical address is `align` aligned.
    #[inline]
    fn align_off(&self, off: u64, align: u64) -> u64 {
        let base = self.min_pfn.base().as_u64();
        align_up(base + off, align) - base
    }

    /// Find and reserve `size` bytes. The memory is not zeroed here.
    ///
    /// `goal` and `limit` are physical addresses, zero meaning "none".
    pub(crate) fn alloc(
        &mut self,
        size: u64,
        align: u64,
        goal: u64,
        limit: u64,
    ) -> Option<PhysicalAddress> {
        assert!(size != 0, "bootmem: zero-sized allocation");
        assert!(
            align.is_power_of_two(),
            "bootmem: alignment {align:#x} is not a power of two"
        );
        assert!(
            limit == 0 || goal.saturating_add(size) <= limit,
            "bootmem: goal {goal:#x} + {size:#x} bytes exceeds limit {limit:#x}"
        );

        assert!(
            !self.is_retired(),
            "bootmem node {} used after release",
            self.nid
        );

        let min = self.min_pfn.as_u64();
        let mut max = self.low_pfn.as_u64();
        let goal_pfn = goal >> PAGE_SHIFT;
        let limit_pfn = limit >> PAGE_SHIFT;

        if limit_pfn != 0 && max > limit_pfn {
            max = limit_pfn;
        }
        if max <= min {
            return None;
        }

        let step = (align >> PAGE_SHIFT).max(1);
        let start = if goal_pfn != 0 && min < goal_pfn && goal_pfn < max {
            align_up(goal_pfn, step)
        } else {
            align_up(min, step)
        };

        let mut sidx = start - min;
        let midx = max - min;
        let mut fallback = 0;

        if self.hint_idx > sidx {
            // Resume after the previous allocation; rescan from `sidx` if that fails.
            fallback = sidx + 1;
            sidx = self.align_idx(self.hint_idx, step);
        }

        loop {
            let map = self.map();
            loop {
                sidx = self.align_idx(map.find_next_zero(bit(sidx), bit(midx)) as u64, step);
                let eidx = sidx + pages_up(size);
                if sidx >= midx || eidx > midx {
                    break;
                }

                if let Some(busy) = map.first_set_in(bit(sidx), bit(eidx)) {
                    let busy = busy as u64;
                    sidx = self.align_idx(busy, step);
                    if sidx == busy {
                        sidx += step;
                    }
                    continue;
                }

                return Some(self.commit(sidx, size, align));
            }

            if fallback == 0 {
                return None;
            }
            sidx = self.align_idx(fallback - 1, step);
            fallback = 0;
        }
    }

    /// Reserve the run found at `sidx`, packing into the tail of the page the
    /// previous allocation ended in when that page directly precedes the run.
    fn commit(&mut self, sidx: u64, size: u64, align: u64) -> PhysicalAddress {
        let start_off = if !self.last_end_off.is_multiple_of(PAGE_SIZE)
            && (self.last_end_off >> PAGE_SHIFT) + 1 == sidx
        {
            self.align_off(self.last_end_off, align)
        } else {
            sidx << PAGE_SHIFT
        };

        // the shared page is already reserved
        let merge = u64::from((start_off >> PAGE_SHIFT) < sidx);
        let end_off = start_off + size;

        self.last_end_off = end_off;
        self.hint_idx = pages_up(end_off);

        let first = self.min_pfn + ((start_off >> PAGE_SHIFT) + merge);
        let end = self.min_pfn + pages_up(end_off);
        if let Err(err) = self.reserve_pfns(first, end, true) {
            panic!("bootmem: freshly found run is busy: {err}");
        }

        self.min_pfn.base() + start_off
    }

    /// Hand every free page and then the bitmap's own pages to `sink`.
    /// The node is unusable afterwards.
    pub(crate) fn release(&mut self, sink: &mut impl PageSink) -> ReleaseSummary {
        let min = self.min_pfn;
        let mut pages = 0;
        for (start, end) in self.map().zero_runs() {
            pages += release_pfn_range(sink, min + start as u64, min + end as u64);
        }

        let map_pfn = Pfn::down(self.map_phys);
        let bitmap_pages = release_pfn_range(sink, map_pfn, map_pfn + bootmap_pages(self.pages()));

        self.state = NodeState::Retired;
        ReleaseSummary {
            pages,
            bitmap_pages,
        }
    }
}
