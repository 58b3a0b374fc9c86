//! Iteration over "memory minus reserved".
//!
//! Both iterators walk the memory set and the *gaps* of the reserved set in
//! lockstep. Gap `g` of a reserved set with `n` regions spans from the end of
//! region `g - 1` (or 0) to the base of region `g` (or the top of the address
//! space), so there are always `n + 1` of them.

use kernel_info::memory::NodeId;
use kernel_memory_addresses::{PhysicalAddress, Pfn};

use crate::region_set::RegionSet;

/// A free physical range `[start, end)` and the node of the memory region it lies in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreeRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub node: Option<NodeId>,
}

impl FreeRange {
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

fn reserved_gap(reserved: &RegionSet<'_>, g: usize) -> (PhysicalAddress, PhysicalAddress) {
    let regions = reserved.regions();
    let start = if g > 0 {
        regions[g - 1].end()
    } else {
        PhysicalAddress::zero()
    };
    let end = regions.get(g).map_or(PhysicalAddress::MAX, |r| r.base());
    (start, end)
}

/// Free ranges in ascending address order.
pub struct FreeRanges<'a, 'm> {
    memory: &'a RegionSet<'m>,
    reserved: &'a RegionSet<'m>,
    nid: Option<NodeId>,
    mi: usize,
    ri: usize,
}

impl<'a, 'm> FreeRanges<'a, 'm> {
    pub(crate) const fn new(
        memory: &'a RegionSet<'m>,
        reserved: &'a RegionSet<'m>,
        nid: Option<NodeId>,
    ) -> Self {
        Self {
            memory,
            reserved,
            nid,
            mi: 0,
            ri: 0,
        }
    }
}

impl Iterator for FreeRanges<'_, '_> {
    type Item = FreeRange;

    fn next(&mut self) -> Option<FreeRange> {
        let mem = self.memory.regions();

        while let Some(m) = mem.get(self.mi) {
            if !m.matches_node(self.nid) {
                self.mi += 1;
                continue;
            }

            while self.ri <= self.reserved.len() {
                let (r_start, r_end) = reserved_gap(self.reserved, self.ri);

                // gap lies beyond this memory region, advance memory
                if r_start >= m.end() {
                    break;
                }

                if m.base() < r_end {
                    let out = FreeRange {
                        start: m.base().max(r_start),
                        end: m.end().min(r_end),
                        node: m.node(),
                    };
                    if m.end() <= r_end {
                        self.mi += 1;
                    } else {
                        self.ri += 1;
                    }
                    return Some(out);
                }

                self.ri += 1;
            }

            self.mi += 1;
        }

        None
    }
}

/// Free ranges in descending address order.
///
/// Cursors are kept one past the current index so that reaching the front of
/// either array is simply zero.
pub struct FreeRangesRev<'a, 'm> {
    memory: &'a RegionSet<'m>,
    reserved: &'a RegionSet<'m>,
    nid: Option<NodeId>,
    mi: usize,
    ri: usize,
}

impl<'a, 'm> FreeRangesRev<'a, 'm> {
    pub(crate) const fn new(
        memory: &'a RegionSet<'m>,
        reserved: &'a RegionSet<'m>,
        nid: Option<NodeId>,
    ) -> Self {
        Self {
            memory,
            reserved,
            nid,
            mi: memory.len(),
            ri: reserved.len() + 1,
        }
    }
}

impl Iterator for FreeRangesRev<'_, '_> {
    type Item = FreeRange;

    fn next(&mut self) -> Option<FreeRange> {
        let mem = self.memory.regions();

        while self.mi > 0 {
            let m = mem[self.mi - 1];
            if !m.matches_node(self.nid) {
                self.mi -= 1;
                continue;
            }

            while self.ri > 0 {
                let (r_start, r_end) = reserved_gap(self.reserved, self.ri - 1);

                // gap lies below this memory region, advance memory
                if r_end <= m.base() {
                    break;
                }

                if m.end() > r_start {
                    let out = FreeRange {
                        start: m.base().max(r_start),
                        end: m.end().min(r_end),
                        node: m.node(),
                    };
                    if m.base() >= r_start {
                        self.mi -= 1;
                    } else {
                        self.ri -= 1;
                    }
                    return Some(out);
                }

                self.ri -= 1;
            }

            self.mi -= 1;
        }

        None
    }
}

/// Page frame span of a memory region; partial pages at either end are excluded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PfnRange {
    pub start: Pfn,
    pub end: Pfn,
    pub node: Option<NodeId>,
}

pub(crate) fn mem_pfn_ranges<'a>(
    memory: &'a RegionSet<'_>,
    nid: Option<NodeId>,
) -> impl Iterator<Item = PfnRange> + 'a {
    memory
        .iter()
        .filter(move |r| r.matches_node(nid))
        .filter_map(|r| {
            let start = Pfn::up(r.base());
            let end = Pfn::down(r.end());
            (start < end).then_some(PfnRange {
                start,
                end,
                node: r.node(),
            })
        })
}
