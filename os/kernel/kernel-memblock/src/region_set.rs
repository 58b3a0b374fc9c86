//! Sorted, non-overlapping, maximally coalesced array of [`Region`]s.
//!
//! The set starts out on [`INIT_MEMBLOCK_REGIONS`] slots stored inline. When the
//! tracker grows it, the slots move into tracked physical memory and the set
//! keeps a mapped slice of them; see [`Memblock`](crate::Memblock) for how that
//! memory is found.

use core::fmt;
use kernel_info::memory::{INIT_MEMBLOCK_REGIONS, NodeId};
use kernel_memory_addresses::PhysicalAddress;

use crate::region::{Region, RegionKind};

enum Storage<'m> {
    Inline([Region; INIT_MEMBLOCK_REGIONS]),
    Mapped {
        phys: PhysicalAddress,
        slots: &'m mut [Region],
    },
}

pub struct RegionSet<'m> {
    kind: RegionKind,
    cnt: usize,
    total_size: u64,
    storage: Storage<'m>,
}

impl<'m> RegionSet<'m> {
    #[must_use]
    pub const fn new(kind: RegionKind) -> Self {
        Self {
            kind,
            cnt: 0,
            total_size: 0,
            storage: Storage::Inline([Region::EMPTY; INIT_MEMBLOCK_REGIONS]),
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.cnt
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    /// Number of slots before the array has to grow.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Sum of all region sizes.
    #[inline]
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Physical location of the slot array, `None` while the inline slots are used.
    #[inline]
    #[must_use]
    pub const fn array_phys(&self) -> Option<PhysicalAddress> {
        match self.storage {
            Storage::Inline(_) => None,
            Storage::Mapped { phys, .. } => Some(phys),
        }
    }

    /// The regions in ascending address order.
    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.slots()[..self.cnt]
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Region> {
        self.regions().iter()
    }

    #[must_use]
    pub fn first(&self) -> Option<&Region> {
        self.regions().first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Region> {
        self.regions().last()
    }

    /// Index of the region containing `addr`.
    #[must_use]
    pub fn search(&self, addr: PhysicalAddress) -> Option<usize> {
        let regions = self.regions();
        let idx = regions.partition_point(|r| r.end() <= addr);
        regions
            .get(idx)
            .filter(|r| r.contains(addr))
            .map(|_| idx)
    }

    /// Index of the first region intersecting `[base, base + size)`.
    #[must_use]
    pub fn overlaps(&self, base: PhysicalAddress, size: u64) -> Option<usize> {
        self.iter().position(|r| r.overlaps(base, size))
    }

    /// Dump entries in the `(index, base, last byte, size)` form.
    pub fn dump_entries(&self) -> impl Iterator<Item = DumpEntry> + '_ {
        self.iter().enumerate().map(|(index, r)| DumpEntry {
            kind: self.kind,
            index,
            base: r.base,
            last: r.end() - 1,
            size: r.size,
            node: r.node,
        })
    }

    fn slots(&self) -> &[Region] {
        match &self.storage {
            Storage::Inline(slots) => slots,
            Storage::Mapped { slots, .. } => slots,
        }
    }

    fn slots_mut(&mut self) -> &mut [Region] {
        match &mut self.storage {
            Storage::Inline(slots) => slots,
            Storage::Mapped { slots, .. } => slots,
        }
    }

    pub(crate) fn region_mut(&mut self, idx: usize) -> &mut Region {
        let cnt = self.cnt;
        &mut self.slots_mut()[..cnt][idx]
    }

    pub(crate) fn sub_total(&mut self, delta: u64) {
        self.total_size -= delta;
    }

    /// Insert a new region at `idx`, shifting the tail up by one slot.
    ///
    /// # Panics
    /// If the array is full; callers grow it first.
    pub(crate) fn insert_at(
        &mut self,
        idx: usize,
        base: PhysicalAddress,
        size: u64,
        node: Option<NodeId>,
    ) {
        let kind = self.kind;
        let cnt = self.cnt;
        let slots = self.slots_mut();
        assert!(cnt < slots.len(), "{kind} region array is full");

        slots.copy_within(idx..cnt, idx + 1);
        slots[idx] = Region::new(base, size, node);
        self.cnt += 1;
        self.total_size += size;
    }

    /// Remove the region at `idx`, shifting the tail down by one slot.
    pub(crate) fn remove_at(&mut self, idx: usize) {
        let cnt = self.cnt;
        let slots = self.slots_mut();
        let removed = slots[idx].size;

        slots.copy_within(idx + 1..cnt, idx);
        slots[cnt - 1] = Region::EMPTY;
        self.cnt -= 1;
        self.total_size -= removed;
    }

    /// Merge neighbouring regions that touch and carry the same node tag.
    ///
    /// # Panics
    /// If two neighbours overlap.
    pub(crate) fn merge(&mut self) {
        let kind = self.kind;
        let mut i = 0;

        while i + 1 < self.cnt {
            let cnt = self.cnt;
            let slots = self.slots_mut();
            let this = slots[i];
            let next = slots[i + 1];

            if this.end() != next.base || this.node != next.node {
                assert!(
                    this.end() <= next.base,
                    "overlapping {kind} regions {this:?} and {next:?}"
                );
                i += 1;
                continue;
            }

            slots[i].size += next.size;
            slots.copy_within(i + 2..cnt, i + 1);
            slots[cnt - 1] = Region::EMPTY;
            self.cnt -= 1;
        }
    }

    /// Walk the gaps of `[base, end)` not covered by existing regions.
    ///
    /// Returns the number of gaps; with `commit` set each gap is inserted as a
    /// new region tagged with `node`.
    pub(crate) fn fill_gaps(
        &mut self,
        base: PhysicalAddress,
        end: PhysicalAddress,
        node: Option<NodeId>,
        commit: bool,
    ) -> usize {
        let mut nr_new = 0;
        let mut cursor = base;
        let mut i = 0;

        while i < self.cnt {
            let r = self.regions()[i];
            if r.base >= end {
                break;
            }
            if r.end() <= cursor {
                i += 1;
                continue;
            }

            if r.base > cursor {
                nr_new += 1;
                if commit {
                    self.insert_at(i, cursor, r.base - cursor, node);
                    i += 1;
                }
            }

            cursor = r.end().min(end);
            i += 1;
        }

        if cursor < end {
            nr_new += 1;
            if commit {
                self.insert_at(i, cursor, end - cursor, node);
            }
        }

        nr_new
    }

    /// Move the slots into `slots` (at physical `phys`), which must be larger.
    ///
    /// Returns the physical location of the previous array if it was mapped.
    pub(crate) fn relocate(
        &mut self,
        phys: PhysicalAddress,
        slots: &'m mut [Region],
    ) -> Option<PhysicalAddress> {
        let old = self.slots();
        debug_assert!(slots.len() > old.len());

        slots[..old.len()].copy_from_slice(old);
        slots[old.len()..].fill(Region::EMPTY);

        match core::mem::replace(&mut self.storage, Storage::Mapped { phys, slots }) {
            Storage::Inline(_) => None,
            Storage::Mapped { phys, .. } => Some(phys),
        }
    }
}

impl<'a> IntoIterator for &'a RegionSet<'_> {
    type Item = &'a Region;
    type IntoIter = core::slice::Iter<'a, Region>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for RegionSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionSet")
            .field("kind", &self.kind)
            .field("cnt", &self.cnt)
            .field("max", &self.capacity())
            .field("total_size", &self.total_size)
            .field("regions", &self.regions())
            .finish()
    }
}

/// One line of a region set dump.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DumpEntry {
    pub kind: RegionKind,
    pub index: usize,
    pub base: PhysicalAddress,
    /// Address of the last byte, `base + size - 1`.
    pub last: PhysicalAddress,
    pub size: u64,
    pub node: Option<NodeId>,
}

impl fmt::Display for DumpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " {}[{:#x}]\t[{:#018x}-{:#018x}], {:#x} bytes",
            self.kind, self.index, self.base, self.last, self.size
        )?;
        if let Some(nid) = self.node {
            write!(f, " on node {nid}")?;
        }
        Ok(())
    }
}
