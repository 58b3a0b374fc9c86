use core::convert::Infallible;
use core::fmt;

use kernel_info::memory::{ARCH_LOW_ADDRESS_LIMIT, MAX_NUMNODES, NodeId};
use kernel_memory_addresses::{
    PAGE_SHIFT, PhysMapper, PhysicalAddress, Pfn, align_up, page_align,
};
use log::{debug, error, info};

use crate::bitmap::PageBitmap;
use crate::error::BootmemError;
use crate::flags::ReserveFlags;
use crate::node::BootmemNode;
use crate::release::{PageSink, ReleaseSummary};
use crate::reserve_log::ReserveLog;

/// Bytes of bitmap needed for `pages` page frames, rounded to whole words.
#[inline]
#[must_use]
pub const fn bootmap_bytes(pages: u64) -> u64 {
    align_up(pages.div_ceil(8), size_of::<u64>() as u64)
}

/// Whole pages needed for the bitmap of `pages` page frames.
#[inline]
#[must_use]
pub const fn bootmap_pages(pages: u64) -> u64 {
    page_align(bootmap_bytes(pages)) >> PAGE_SHIFT
}

/// Pages entirely inside `[addr, addr + size)`.
fn pfns_inward(addr: PhysicalAddress, size: u64) -> (Pfn, Pfn) {
    (Pfn::up(addr), Pfn::down(addr.saturating_add(size)))
}

/// Pages touched by `[addr, addr + size)`.
fn pfns_outward(addr: PhysicalAddress, size: u64) -> (Pfn, Pfn) {
    (Pfn::down(addr), Pfn::up(addr.saturating_add(size)))
}

/// Snapshot of one node for dumps.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NodeInfo {
    pub nid: NodeId,
    pub min_pfn: Pfn,
    pub low_pfn: Pfn,
    pub map: PhysicalAddress,
    pub free_pages: u64,
    pub retired: bool,
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {}: pfn [{}-{}), {} of {} pages free, bitmap at {}",
            self.nid,
            self.min_pfn,
            self.low_pfn,
            self.free_pages,
            self.low_pfn - self.min_pfn,
            self.map
        )?;
        if self.retired {
            f.write_str(" (released)")?;
        }
        Ok(())
    }
}

/// The boot bitmap allocator.
///
/// Up to [`MAX_NUMNODES`] nodes, each owning a bitmap over a window of page
/// frames, are kept in a list sorted by their first frame. Ranges handed to
/// [`free`](Self::free) and [`reserve`](Self::reserve) may span several
/// adjacent nodes; allocations try the nodes in list order.
pub struct Bootmem<'m, M: PhysMapper> {
    nodes: [Option<BootmemNode<'m>>; MAX_NUMNODES],
    order: [NodeId; MAX_NUMNODES],
    linked: usize,
    debug: bool,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> Bootmem<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            nodes: [const { None }; MAX_NUMNODES],
            order: [0; MAX_NUMNODES],
            linked: 0,
            debug: false,
            mapper,
        }
    }

    /// Trace every mark and allocation at debug level.
    pub const fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    fn node(&self, nid: NodeId) -> &BootmemNode<'m> {
        match self.nodes.get(usize::from(nid)) {
            Some(Some(node)) => node,
            _ => panic!("bootmem node {nid} is not initialized"),
        }
    }

    fn node_mut(&mut self, nid: NodeId) -> &mut BootmemNode<'m> {
        match self.nodes.get_mut(usize::from(nid)) {
            Some(Some(node)) => node,
            _ => panic!("bootmem node {nid} is not initialized"),
        }
    }

    /// Node ids in list order.
    fn linked(&self) -> &[NodeId] {
        &self.order[..self.linked]
    }

    fn link(&mut self, node: BootmemNode<'m>) {
        let nid = node.nid();
        let pos = self
            .linked()
            .partition_point(|&other| self.node(other).min_pfn() <= node.min_pfn());
        self.order.copy_within(pos..self.linked, pos + 1);
        self.order[pos] = nid;
        self.linked += 1;
        self.nodes[usize::from(nid)] = Some(node);
    }

    /// Install node `nid` over page frames `[min_pfn, low_pfn)`, with its
    /// bitmap stored at page frame `map`. Every page starts out reserved.
    ///
    /// Returns the bitmap size in bytes.
    ///
    /// # Safety
    /// - `[map, map + bootmap_bytes(low_pfn - min_pfn))` must be reachable
    ///   through the mapper and used by nothing else for `'m`.
    /// - Every page frame in `[min_pfn, low_pfn)` must be RAM reachable through
    ///   the mapper; allocations are zeroed through it.
    ///
    /// # Panics
    /// If `nid` is out of range or already installed, or `low_pfn < min_pfn`.
    pub unsafe fn init_node(&mut self, nid: NodeId, map: Pfn, min_pfn: Pfn, low_pfn: Pfn) -> u64 {
        assert!(
            usize::from(nid) < MAX_NUMNODES,
            "bootmem node {nid} out of range"
        );
        assert!(
            self.nodes[usize::from(nid)].is_none(),
            "bootmem node {nid} initialized twice"
        );
        assert!(
            min_pfn <= low_pfn,
            "bootmem node {nid}: empty window [{min_pfn}, {low_pfn})"
        );

        let pages = low_pfn - min_pfn;
        let bytes = bootmap_bytes(pages);
        let (Ok(words), Ok(bits)) = (usize::try_from(bytes / 8), usize::try_from(pages)) else {
            panic!("bootmem node {nid}: bitmap for {pages} pages is not addressable");
        };

        // SAFETY: the caller hands over the bitmap range for `'m`.
        let words = unsafe { self.mapper.phys_to_slice_mut::<u64>(map.base(), words) };
        let mut bitmap = PageBitmap::new(words, bits);
        bitmap.fill();

        self.link(BootmemNode::new(nid, bitmap, map.base(), min_pfn, low_pfn));

        if self.debug {
            debug!(
                "bootmem: node {nid} pfn [{min_pfn}-{low_pfn}) map at {} ({bytes} bytes)",
                map.base()
            );
        }
        bytes
    }

    /// Single-node setup: node 0 covering page frames `[0, low_pfn)`.
    ///
    /// # Safety
    /// As for [`init_node`](Self::init_node).
    pub unsafe fn init(&mut self, map: Pfn, low_pfn: Pfn) -> u64 {
        // SAFETY: forwarded.
        unsafe { self.init_node(0, map, Pfn::new(0), low_pfn) }
    }

    /// Apply `f` to each node's share of `[start, end)`, in list order.
    ///
    /// # Panics
    /// If the range does not start inside a node or crosses a hole between nodes.
    fn walk<E>(
        &mut self,
        start: Pfn,
        end: Pfn,
        mut f: impl FnMut(&mut BootmemNode<'m>, Pfn, Pfn) -> Result<(), E>,
    ) -> Result<(), E> {
        if start >= end {
            return Ok(());
        }

        let mut pos = start;
        for i in 0..self.linked {
            let node = self.node_mut(self.order[i]);
            if pos < node.min_pfn() || pos >= node.low_pfn() {
                assert!(
                    pos == start,
                    "bootmem: [{start}-{end}) crosses a hole at {pos}"
                );
                continue;
            }

            let max = node.low_pfn().min(end);
            f(node, pos, max)?;
            if max == end {
                return Ok(());
            }
            pos = max;
        }

        panic!("bootmem: [{start}-{end}) is not covered by any node")
    }

    fn trace(&self, what: &str, start: Pfn, end: Pfn) {
        if self.debug {
            debug!("bootmem: {what} pfn [{start}-{end})");
        }
    }

    /// Mark the pages entirely inside `[addr, addr + size)` free.
    ///
    /// # Panics
    /// If one of the pages is not reserved, or the range is not covered by nodes.
    pub fn free(&mut self, addr: PhysicalAddress, size: u64) {
        let (start, end) = pfns_inward(addr, size);
        self.trace("free", start, end);
        let Ok(()) = self.walk::<Infallible>(start, end, |node, s, e| {
            node.free_pfns(s, e);
            Ok(())
        });
    }

    /// [`free`](Self::free) restricted to node `nid`.
    pub fn free_node(&mut self, nid: NodeId, addr: PhysicalAddress, size: u64) {
        let (start, end) = pfns_inward(addr, size);
        self.trace("free", start, end);
        if start < end {
            self.node_mut(nid).free_pfns(start, end);
        }
    }

    /// Mark every page touched by `[addr, addr + size)` reserved.
    ///
    /// With [`ReserveFlags::exclusive`] the call fails on the first page that
    /// is already reserved and leaves the bitmap as it was.
    ///
    /// # Errors
    /// [`BootmemError::Busy`] for an exclusive reservation over a reserved page.
    pub fn reserve(
        &mut self,
        addr: PhysicalAddress,
        size: u64,
        flags: ReserveFlags,
    ) -> Result<(), BootmemError> {
        let (start, end) = pfns_outward(addr, size);
        self.trace("reserve", start, end);

        let exclusive = flags.exclusive();
        let mut log = ReserveLog::new();
        let result = self.walk(start, end, |node, s, e| {
            node.reserve_pfns(s, e, exclusive)?;
            log.push(node.nid(), s, e);
            Ok(())
        });

        if result.is_err() {
            for (nid, s, e) in log.undo() {
                self.node_mut(nid).free_pfns(s, e);
            }
        }
        result
    }

    /// [`reserve`](Self::reserve) restricted to node `nid`.
    ///
    /// # Errors
    /// [`BootmemError::Busy`] for an exclusive reservation over a reserved page.
    pub fn reserve_node(
        &mut self,
        nid: NodeId,
        addr: PhysicalAddress,
        size: u64,
        flags: ReserveFlags,
    ) -> Result<(), BootmemError> {
        let (start, end) = pfns_outward(addr, size);
        self.trace("reserve", start, end);
        self.node_mut(nid).reserve_pfns(start, end, flags.exclusive())
    }

    fn hand_out(&self, pa: PhysicalAddress, size: u64, align: u64) -> PhysicalAddress {
        // SAFETY: `pa` lies in a node window, which `init_node` requires to be
        // mapped RAM, and its pages were free until just now.
        unsafe { self.mapper.zero(pa, size) };
        if self.debug {
            debug!("bootmem: alloc {size:#x} bytes align {align:#x} at {pa}");
        }
        pa
    }

    fn alloc_core(
        &mut self,
        size: u64,
        align: u64,
        goal: u64,
        limit: u64,
    ) -> Option<PhysicalAddress> {
        for i in 0..self.linked {
            let node = self.node_mut(self.order[i]);
            if goal != 0 && node.low_pfn().as_u64() <= goal >> PAGE_SHIFT {
                continue;
            }
            if limit != 0 && node.min_pfn().as_u64() >= limit >> PAGE_SHIFT {
                break;
            }
            if let Some(pa) = node.alloc(size, align, goal, limit) {
                return Some(pa);
            }
        }
        None
    }

    fn alloc_anywhere(
        &mut self,
        size: u64,
        align: u64,
        goal: u64,
        limit: u64,
    ) -> Option<PhysicalAddress> {
        let mut goal = goal;
        loop {
            if let Some(pa) = self.alloc_core(size, align, goal, limit) {
                return Some(self.hand_out(pa, size, align));
            }
            if goal == 0 {
                return None;
            }
            goal = 0;
        }
    }

    fn alloc_on_node(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: u64,
        limit: u64,
    ) -> Option<PhysicalAddress> {
        let (mut goal, mut limit) = (goal, limit);
        loop {
            if limit != 0 && goal.saturating_add(size) > limit {
                limit = 0;
            }

            let found = match self.node_mut(nid).alloc(size, align, goal, limit) {
                Some(pa) => Some(pa),
                None => self.alloc_core(size, align, goal, limit),
            };
            if let Some(pa) = found {
                return Some(self.hand_out(pa, size, align));
            }

            if goal == 0 {
                return None;
            }
            goal = 0;
        }
    }

    fn out_of_memory(size: u64) -> ! {
        error!("bootmem alloc of {size} bytes failed!");
        panic!("Out of memory: bootmem alloc of {size:#x} bytes failed");
    }

    /// Allocate `size` zeroed bytes aligned to `align`, preferably at or
    /// above `goal` (zero for no preference). A failed search is retried
    /// once without the goal.
    ///
    /// # Panics
    /// If no node has room, if `size` is zero or if `align` is not a power of two.
    pub fn alloc(&mut self, size: u64, align: u64, goal: PhysicalAddress) -> PhysicalAddress {
        self.alloc_nopanic(size, align, goal)
            .unwrap_or_else(|| Self::out_of_memory(size))
    }

    /// Like [`alloc`](Self::alloc), returning `None` when no node has room.
    pub fn alloc_nopanic(
        &mut self,
        size: u64,
        align: u64,
        goal: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        self.alloc_anywhere(size, align, goal.as_u64(), 0)
    }

    /// Like [`alloc`](Self::alloc), staying below [`ARCH_LOW_ADDRESS_LIMIT`].
    pub fn alloc_low(&mut self, size: u64, align: u64, goal: PhysicalAddress) -> PhysicalAddress {
        self.alloc_low_nopanic(size, align, goal)
            .unwrap_or_else(|| Self::out_of_memory(size))
    }

    pub fn alloc_low_nopanic(
        &mut self,
        size: u64,
        align: u64,
        goal: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        self.alloc_anywhere(size, align, goal.as_u64(), ARCH_LOW_ADDRESS_LIMIT)
    }

    /// Allocate from node `nid`, falling back to all nodes in list order.
    ///
    /// # Panics
    /// If no node has room, or if `nid` is not installed.
    pub fn alloc_node(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: PhysicalAddress,
    ) -> PhysicalAddress {
        self.alloc_node_nopanic(nid, size, align, goal)
            .unwrap_or_else(|| Self::out_of_memory(size))
    }

    pub fn alloc_node_nopanic(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        self.alloc_on_node(nid, size, align, goal.as_u64(), 0)
    }

    /// [`alloc_node`](Self::alloc_node) below [`ARCH_LOW_ADDRESS_LIMIT`]. The
    /// limit is dropped when `goal + size` already exceeds it.
    pub fn alloc_low_node(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: PhysicalAddress,
    ) -> PhysicalAddress {
        self.alloc_on_node(nid, size, align, goal.as_u64(), ARCH_LOW_ADDRESS_LIMIT)
            .unwrap_or_else(|| Self::out_of_memory(size))
    }

    /// Give the pages entirely inside `[addr, addr + size)` straight to the
    /// page allocator, one page at a time, bypassing the bitmaps. For use
    /// after [`release_all`](Self::release_all).
    pub fn free_late(&self, addr: PhysicalAddress, size: u64, sink: &mut impl PageSink) -> u64 {
        let (start, end) = pfns_inward(addr, size);
        self.trace("free late", start, end);

        let mut pfn = start;
        while pfn < end {
            sink.free_pages(pfn, 0);
            pfn += 1;
        }
        end.as_u64().saturating_sub(start.as_u64())
    }

    /// Hand every free page of every node to `sink`, followed by each
    /// node's bitmap pages. All nodes are retired afterwards.
    pub fn release_all(&mut self, sink: &mut impl PageSink) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();
        for i in 0..self.linked {
            let nid = self.order[i];
            let part = self.node_mut(nid).release(sink);
            if self.debug {
                debug!("bootmem: node {nid} released {:#x} pages", part.total());
            }
            summary.pages += part.pages;
            summary.bitmap_pages += part.bitmap_pages;
        }

        info!("bootmem: {summary}");
        summary
    }

    /// Number of free pages on node `nid`, zero once released.
    ///
    /// # Panics
    /// If `nid` is not installed.
    #[must_use]
    pub fn free_pages(&self, nid: NodeId) -> u64 {
        self.node(nid).free_pages()
    }

    #[must_use]
    pub fn node_info(&self, nid: NodeId) -> Option<NodeInfo> {
        let node = self.nodes.get(usize::from(nid))?.as_ref()?;
        Some(NodeInfo {
            nid,
            min_pfn: node.min_pfn(),
            low_pfn: node.low_pfn(),
            map: node.map_phys(),
            free_pages: node.free_pages(),
            retired: node.is_retired(),
        })
    }

    /// Installed nodes in list order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeInfo> + '_ {
        self.linked().iter().filter_map(|&nid| self.node_info(nid))
    }

    /// Whether [`release_all`](Self::release_all) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.linked > 0 && self.nodes().all(|n| n.retired)
    }
}

impl<M: PhysMapper> fmt::Display for Bootmem<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for info in self.nodes() {
            writeln!(f, " {info}")?;
        }
        Ok(())
    }
}

impl<M: PhysMapper> fmt::Debug for Bootmem<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.nodes()).finish()
    }
}
