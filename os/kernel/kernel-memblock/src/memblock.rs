use core::fmt;
use core::mem::MaybeUninit;
use core::ops::Range;
use core::panic::Location;

use kernel_info::memory::{NodeId, SMP_CACHE_BYTES};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysMapper, PhysicalAddress, Pfn, align_down, align_up, checked_align_up,
    page_align,
};
use log::{debug, error, info, warn};

use crate::error::MemblockError;
use crate::free_range::{FreeRanges, FreeRangesRev, PfnRange, mem_pfn_ranges};
use crate::region::{Region, RegionKind};
use crate::region_set::RegionSet;

/// Upper bound meaning "no limit at all".
pub const ALLOC_ANYWHERE: PhysicalAddress = PhysicalAddress::MAX;

/// Upper bound meaning "up to the current limit".
pub const ALLOC_ACCESSIBLE: PhysicalAddress = PhysicalAddress::zero();

/// Shrink `size` so that `base + size` does not overflow.
#[inline]
const fn cap_size(base: PhysicalAddress, size: u64) -> u64 {
    let room = u64::MAX - base.as_u64();
    if size < room { size } else { room }
}

/// The region tracker.
///
/// Holds the `memory` and `reserved` region sets and answers placement
/// queries against "memory minus reserved". Physical memory is only touched
/// when a region array has to grow, through `M`.
pub struct Memblock<'m, M: PhysMapper> {
    memory: RegionSet<'m>,
    reserved: RegionSet<'m>,
    current_limit: PhysicalAddress,
    can_resize: bool,
    frozen: bool,
    debug: bool,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> Memblock<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            memory: RegionSet::new(RegionKind::Memory),
            reserved: RegionSet::new(RegionKind::Reserved),
            current_limit: ALLOC_ANYWHERE,
            can_resize: false,
            frozen: false,
            debug: false,
            mapper,
        }
    }

    /// Trace every reservation change at debug level.
    pub const fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    #[inline]
    #[must_use]
    pub const fn memory(&self) -> &RegionSet<'m> {
        &self.memory
    }

    #[inline]
    #[must_use]
    pub const fn reserved(&self) -> &RegionSet<'m> {
        &self.reserved
    }

    #[inline]
    #[must_use]
    pub const fn current_limit(&self) -> PhysicalAddress {
        self.current_limit
    }

    /// Cap for every allocation passing [`ALLOC_ACCESSIBLE`].
    pub const fn set_current_limit(&mut self, limit: PhysicalAddress) {
        self.current_limit = limit;
    }

    /// Permit the region arrays to grow.
    ///
    /// Until this is called the arrays stay on their inline slots, since a
    /// grown array could land on memory whose reservation is not known yet.
    pub fn allow_resize(&mut self) {
        if self.frozen {
            warn!("memblock: resize requested after handoff, ignoring");
            return;
        }
        self.can_resize = true;
    }

    /// Forbid any further growth; called once the tracker is retired.
    pub const fn freeze(&mut self) {
        self.frozen = true;
        self.can_resize = false;
    }

    #[inline]
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    const fn set(&self, kind: RegionKind) -> &RegionSet<'m> {
        match kind {
            RegionKind::Memory => &self.memory,
            RegionKind::Reserved => &self.reserved,
        }
    }

    const fn set_mut(&mut self, kind: RegionKind) -> &mut RegionSet<'m> {
        match kind {
            RegionKind::Memory => &mut self.memory,
            RegionKind::Reserved => &mut self.reserved,
        }
    }

    /// Double the slot array of `kind`.
    ///
    /// The new array is placed in free tracked memory. When growing the
    /// reserved set, `[avoid_base, avoid_base + avoid_size)` is kept clear since
    /// that range is about to be reserved but is not in the set yet.
    fn double_array(
        &mut self,
        kind: RegionKind,
        avoid_base: PhysicalAddress,
        avoid_size: u64,
    ) -> Result<(), MemblockError> {
        let old_max = self.set(kind).capacity();
        if !self.can_resize {
            return Err(MemblockError::ResizeNotAllowed {
                kind,
                capacity: old_max,
            });
        }

        let new_max = old_max << 1;
        let old_size = (old_max * size_of::<Region>()) as u64;
        let old_alloc_size = page_align(old_size);
        let new_alloc_size = page_align(old_size << 1);

        let (avoid_base, avoid_size) = match kind {
            RegionKind::Reserved => (avoid_base, avoid_size),
            RegionKind::Memory => (PhysicalAddress::zero(), 0),
        };

        let limit = self.current_limit;
        let addr = self
            .find_in_range(
                avoid_base.saturating_add(avoid_size),
                limit,
                new_alloc_size,
                PAGE_SIZE,
            )
            .or_else(|| {
                if avoid_size == 0 {
                    return None;
                }
                self.find_in_range(
                    PhysicalAddress::zero(),
                    avoid_base.min(limit),
                    new_alloc_size,
                    PAGE_SIZE,
                )
            });

        let Some(addr) = addr else {
            error!("memblock: failed to double {kind} array from {old_max} to {new_max} entries");
            return Err(MemblockError::ResizeFailed {
                kind,
                from: old_max,
                to: new_max,
            });
        };

        if self.debug {
            debug!(
                "memblock: {kind} is doubled to {new_max} at [{addr:#010x}-{:#010x}]",
                addr + new_alloc_size - 1
            );
        }

        // SAFETY: `addr` was found free in tracked memory and is page aligned;
        // nothing else refers to it until it is reserved below.
        let raw: &'m mut [MaybeUninit<Region>] =
            unsafe { self.mapper.phys_to_slice_mut(addr, new_max) };
        for slot in raw.iter_mut() {
            slot.write(Region::EMPTY);
        }
        // SAFETY: every slot was initialized above.
        let slots = unsafe { &mut *(core::ptr::from_mut(raw) as *mut [Region]) };

        let old = self.set_mut(kind).relocate(addr, slots);

        // The new array is reserved before the old one is released, so a
        // nested growth of the reserved set cannot land on it.
        if let Err(err) = self.add_range(RegionKind::Reserved, addr, new_alloc_size, None) {
            panic!("memblock: cannot reserve relocated {kind} array at {addr:#x}: {err}");
        }

        if let Some(old) = old {
            if let Err(err) = self.remove_range(RegionKind::Reserved, old, old_alloc_size) {
                warn!("memblock: failed to release old {kind} array at {old:#x}: {err}");
            }
        }

        Ok(())
    }

    /// Insert `[base, base + size)` into `kind`, merging with what is there.
    fn add_range(
        &mut self,
        kind: RegionKind,
        base: PhysicalAddress,
        size: u64,
        node: Option<NodeId>,
    ) -> Result<(), MemblockError> {
        let size = cap_size(base, size);
        if size == 0 {
            return Ok(());
        }

        let set = self.set_mut(kind);
        if set.is_empty() {
            set.insert_at(0, base, size, node);
            return Ok(());
        }

        let end = base + size;
        let nr_new = set.fill_gaps(base, end, node, false);
        while self.set(kind).len() + nr_new > self.set(kind).capacity() {
            self.double_array(kind, base, size)?;
        }

        let set = self.set_mut(kind);
        set.fill_gaps(base, end, node, true);
        set.merge();
        Ok(())
    }

    /// Split regions of `kind` so that `[base, base + size)` is covered by
    /// whole regions, and return their index range.
    fn isolate_range(
        &mut self,
        kind: RegionKind,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<Range<usize>, MemblockError> {
        let size = cap_size(base, size);
        if size == 0 {
            return Ok(0..0);
        }
        let end = base + size;

        // at most two more regions are created
        while self.set(kind).len() + 2 > self.set(kind).capacity() {
            self.double_array(kind, base, size)?;
        }

        let set = self.set_mut(kind);
        let mut isolated: Option<Range<usize>> = None;
        let mut i = 0;

        while i < set.len() {
            let r = set.regions()[i];
            let (rbase, rend) = (r.base(), r.end());

            if rbase >= end {
                break;
            }
            if rend <= base {
                i += 1;
                continue;
            }

            if rbase < base {
                // straddles the start: split off the part below
                let below = base - rbase;
                let rgn = set.region_mut(i);
                rgn.base = base;
                rgn.size -= below;
                set.sub_total(below);
                set.insert_at(i, rbase, below, r.node());
            } else if rend > end {
                // straddles the end: split off the part inside and look at it again
                let inside = end - rbase;
                let rgn = set.region_mut(i);
                rgn.base = end;
                rgn.size -= inside;
                set.sub_total(inside);
                set.insert_at(i, rbase, inside, r.node());
                continue;
            } else {
                isolated = Some(isolated.map_or(i..i + 1, |range| range.start..i + 1));
            }

            i += 1;
        }

        Ok(isolated.unwrap_or(0..0))
    }

    fn remove_range(
        &mut self,
        kind: RegionKind,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<(), MemblockError> {
        let range = self.isolate_range(kind, base, size)?;
        let set = self.set_mut(kind);
        for i in range.rev() {
            set.remove_at(i);
        }
        Ok(())
    }

    /// Register `[base, base + size)` as memory belonging to node `nid`.
    ///
    /// # Errors
    /// If the memory array has to grow and cannot.
    pub fn add_node(
        &mut self,
        base: PhysicalAddress,
        size: u64,
        nid: NodeId,
    ) -> Result<(), MemblockError> {
        self.add_range(RegionKind::Memory, base, size, Some(nid))
    }

    /// Register `[base, base + size)` as memory. Overlap with existing
    /// memory is fine; the result is the union.
    ///
    /// # Errors
    /// If the memory array has to grow and cannot.
    pub fn add(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemblockError> {
        self.add_range(RegionKind::Memory, base, size, None)
    }

    /// Take `[base, base + size)` out of memory entirely.
    ///
    /// # Errors
    /// If splitting a region requires growing the array and that fails.
    pub fn remove(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemblockError> {
        self.remove_range(RegionKind::Memory, base, size)
    }

    /// Mark `[base, base + size)` as in use.
    ///
    /// # Errors
    /// If the reserved array has to grow and cannot.
    #[track_caller]
    pub fn reserve(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemblockError> {
        if self.debug {
            debug!(
                "memblock_reserve: [{base:#018x}-{:#018x}] {}",
                base.saturating_add(size).saturating_sub(1),
                Location::caller()
            );
        }
        self.add_range(RegionKind::Reserved, base, size, None)
    }

    /// Release a reservation of `[base, base + size)`.
    ///
    /// # Errors
    /// If splitting a reservation requires growing the array and that fails.
    #[track_caller]
    pub fn free(&mut self, base: PhysicalAddress, size: u64) -> Result<(), MemblockError> {
        if self.debug {
            debug!(
                "memblock_free: [{base:#018x}-{:#018x}] {}",
                base.saturating_add(size).saturating_sub(1),
                Location::caller()
            );
        }
        self.remove_range(RegionKind::Reserved, base, size)
    }

    /// Tag the memory in `[base, base + size)` with node `nid`.
    ///
    /// # Errors
    /// If splitting a region requires growing the array and that fails.
    pub fn set_node(
        &mut self,
        base: PhysicalAddress,
        size: u64,
        nid: NodeId,
    ) -> Result<(), MemblockError> {
        let range = self.isolate_range(RegionKind::Memory, base, size)?;
        for i in range {
            self.memory.region_mut(i).node = Some(nid);
        }
        self.memory.merge();
        Ok(())
    }

    /// Free ranges of node `nid` (or all nodes) in ascending order.
    pub fn free_ranges(&self, nid: Option<NodeId>) -> FreeRanges<'_, 'm> {
        FreeRanges::new(&self.memory, &self.reserved, nid)
    }

    /// Free ranges of node `nid` (or all nodes) in descending order.
    pub fn free_ranges_rev(&self, nid: Option<NodeId>) -> FreeRangesRev<'_, 'm> {
        FreeRangesRev::new(&self.memory, &self.reserved, nid)
    }

    /// Whole-page spans of the memory regions of node `nid` (or all nodes).
    pub fn mem_pfn_ranges(&self, nid: Option<NodeId>) -> impl Iterator<Item = PfnRange> + '_ {
        mem_pfn_ranges(&self.memory, nid)
    }

    /// Find the highest `align`ed address in `[start, end)` where `size`
    /// bytes of memory are free on node `nid`.
    ///
    /// `end` of [`ALLOC_ACCESSIBLE`] means the current limit. The first page
    /// of physical memory is never returned.
    #[must_use]
    pub fn find_in_range_node(
        &self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        size: u64,
        align: u64,
        nid: Option<NodeId>,
    ) -> Option<PhysicalAddress> {
        debug_assert!(align == 0 || align.is_power_of_two(), "bad alignment {align:#x}");
        let align = align.max(1);

        let end = if end == ALLOC_ACCESSIBLE {
            self.current_limit
        } else {
            end
        };
        let start = start.max(PhysicalAddress::new(PAGE_SIZE));
        let end = end.max(start);

        self.free_ranges_rev(nid).find_map(|range| {
            let this_start = range.start.clamp(start, end);
            let this_end = range.end.clamp(start, end);
            if this_end.as_u64() < size {
                return None;
            }
            let cand = PhysicalAddress::new(align_down(this_end.as_u64() - size, align));
            (cand >= this_start).then_some(cand)
        })
    }

    /// [`find_in_range_node`](Self::find_in_range_node) on any node.
    #[must_use]
    pub fn find_in_range(
        &self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        size: u64,
        align: u64,
    ) -> Option<PhysicalAddress> {
        self.find_in_range_node(start, end, size, align, None)
    }

    fn alloc_base_nid(
        &mut self,
        size: u64,
        align: u64,
        max_addr: PhysicalAddress,
        nid: Option<NodeId>,
    ) -> Option<PhysicalAddress> {
        let align = if align == 0 {
            warn!("memblock: zero alignment requested, using {SMP_CACHE_BYTES}");
            SMP_CACHE_BYTES
        } else {
            align
        };

        // keep the reserved array from fragmenting
        let size = checked_align_up(size, align)?;
        let found = self.find_in_range_node(PhysicalAddress::zero(), max_addr, size, align, nid)?;
        self.add_range(RegionKind::Reserved, found, size, None)
            .ok()
            .map(|()| found)
    }

    /// Allocate on node `nid` below the current limit.
    pub fn alloc_nid(&mut self, size: u64, align: u64, nid: NodeId) -> Option<PhysicalAddress> {
        self.alloc_base_nid(size, align, ALLOC_ACCESSIBLE, Some(nid))
    }

    /// Allocate below `max_addr` on any node.
    pub fn try_alloc_base(
        &mut self,
        size: u64,
        align: u64,
        max_addr: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        self.alloc_base_nid(size, align, max_addr, None)
    }

    /// Allocate below `max_addr`.
    ///
    /// # Panics
    /// If no suitable memory is left.
    pub fn alloc_base(
        &mut self,
        size: u64,
        align: u64,
        max_addr: PhysicalAddress,
    ) -> PhysicalAddress {
        let Some(addr) = self.try_alloc_base(size, align, max_addr) else {
            panic!("ERROR: Failed to allocate {size:#x} bytes below {max_addr:#x}.");
        };
        addr
    }

    /// Allocate below the current limit.
    ///
    /// # Panics
    /// If no suitable memory is left.
    pub fn alloc(&mut self, size: u64, align: u64) -> PhysicalAddress {
        self.alloc_base(size, align, ALLOC_ACCESSIBLE)
    }

    /// Allocate on node `nid`, falling back to any node.
    ///
    /// # Panics
    /// If no suitable memory is left on any node.
    pub fn alloc_try_nid(&mut self, size: u64, align: u64, nid: NodeId) -> PhysicalAddress {
        if let Some(addr) = self.alloc_nid(size, align, nid) {
            return addr;
        }
        self.alloc(size, align)
    }

    /// Total size of all memory.
    #[must_use]
    pub const fn phys_mem_size(&self) -> u64 {
        self.memory.total_size()
    }

    /// Bytes of whole pages of memory below page frame `limit`.
    #[must_use]
    pub fn mem_size(&self, limit: Pfn) -> u64 {
        let pages: u64 = self
            .mem_pfn_ranges(None)
            .map(|r| r.end.min(limit) - r.start.min(limit))
            .sum();
        Pfn::new(pages).base().as_u64()
    }

    /// Lowest address of memory, zero if there is none.
    #[must_use]
    pub fn start_of_dram(&self) -> PhysicalAddress {
        self.memory.first().map_or(PhysicalAddress::zero(), Region::base)
    }

    /// One past the highest address of memory, zero if there is none.
    #[must_use]
    pub fn end_of_dram(&self) -> PhysicalAddress {
        self.memory.last().map_or(PhysicalAddress::zero(), Region::end)
    }

    /// Keep only the first `limit` bytes of memory; memory and reservations
    /// above that point are dropped. A limit of zero does nothing.
    ///
    /// # Errors
    /// If splitting a region requires growing an array and that fails.
    pub fn enforce_memory_limit(&mut self, limit: u64) -> Result<(), MemblockError> {
        if limit == 0 {
            return Ok(());
        }

        let mut left = limit;
        let mut max_addr = ALLOC_ANYWHERE;
        for r in &self.memory {
            if left <= r.size() {
                max_addr = r.base() + left;
                break;
            }
            left -= r.size();
        }

        info!("memblock: limiting memory to {limit:#x} bytes, truncating at {max_addr:#x}");
        self.remove_range(RegionKind::Memory, max_addr, u64::MAX)?;
        self.remove_range(RegionKind::Reserved, max_addr, u64::MAX)
    }

    /// Whether `addr` is reserved.
    #[must_use]
    pub fn is_reserved(&self, addr: PhysicalAddress) -> bool {
        self.reserved.search(addr).is_some()
    }

    /// Whether `addr` is memory.
    #[must_use]
    pub fn is_memory(&self, addr: PhysicalAddress) -> bool {
        self.memory.search(addr).is_some()
    }

    /// Whether `[base, base + size)` lies entirely within one memory region.
    #[must_use]
    pub fn is_region_memory(&self, base: PhysicalAddress, size: u64) -> bool {
        let end = base + cap_size(base, size);
        self.memory
            .search(base)
            .is_some_and(|idx| self.memory.regions()[idx].end() >= end)
    }

    /// Whether any part of `[base, base + size)` is reserved.
    #[must_use]
    pub fn is_region_reserved(&self, base: PhysicalAddress, size: u64) -> bool {
        self.reserved.overlaps(base, cap_size(base, size)).is_some()
    }

    /// Round every memory region inward to `align`; regions that vanish are removed.
    pub fn trim_memory(&mut self, align: u64) {
        let mut i = 0;
        while i < self.memory.len() {
            let r = self.memory.regions()[i];
            let (orig_start, orig_end) = (r.base().as_u64(), r.end().as_u64());
            let start = align_up(orig_start, align);
            let end = align_down(orig_end, align);

            if start == orig_start && end == orig_end {
                i += 1;
                continue;
            }

            if start < end {
                let rgn = self.memory.region_mut(i);
                rgn.base = PhysicalAddress::new(start);
                rgn.size = end - start;
                self.memory.sub_total(r.size() - (end - start));
                i += 1;
            } else {
                self.memory.remove_at(i);
            }
        }
    }

    /// Location and page-aligned size of the grown reserved array, `None`
    /// while the inline slots are still in use.
    #[must_use]
    pub fn reserved_array_info(&self) -> Option<(PhysicalAddress, u64)> {
        let phys = self.reserved.array_phys()?;
        let size = page_align((self.reserved.capacity() * size_of::<Region>()) as u64);
        Some((phys, size))
    }

    /// Log the full configuration at info level.
    pub fn dump_all(&self) {
        info!("MEMBLOCK configuration:");
        info!(
            " memory size = {:#x} reserved size = {:#x}",
            self.memory.total_size(),
            self.reserved.total_size()
        );
        for set in [&self.memory, &self.reserved] {
            info!(" {}.cnt  = {:#x}", set.kind(), set.len());
            for entry in set.dump_entries() {
                info!("{entry}");
            }
        }
    }
}

impl<M: PhysMapper> fmt::Display for Memblock<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MEMBLOCK configuration:")?;
        writeln!(
            f,
            " memory size = {:#x} reserved size = {:#x}",
            self.memory.total_size(),
            self.reserved.total_size()
        )?;
        for set in [&self.memory, &self.reserved] {
            writeln!(f, " {}.cnt  = {:#x}", set.kind(), set.len())?;
            for entry in set.dump_entries() {
                writeln!(f, "{entry}")?;
            }
        }
        Ok(())
    }
}

impl<M: PhysMapper> fmt::Debug for Memblock<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memblock")
            .field("memory", &self.memory)
            .field("reserved", &self.reserved)
            .field("current_limit", &self.current_limit)
            .field("can_resize", &self.can_resize)
            .field("frozen", &self.frozen)
            .finish_non_exhaustive()
    }
}
