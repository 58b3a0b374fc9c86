//! Handing free page frames to the general page allocator.

use core::fmt;

use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::Pfn;

/// Receiver of page frames leaving the boot allocator.
///
/// Every call transfers `1 << order` contiguous frames starting at `first`,
/// where `first` is aligned to that block size.
pub trait PageSink {
    fn free_pages(&mut self, first: Pfn, order: u32);
}

impl<F: FnMut(Pfn, u32)> PageSink for F {
    #[inline]
    fn free_pages(&mut self, first: Pfn, order: u32) {
        self(first, order);
    }
}

/// Page counts transferred by [`Bootmem::release_all`](crate::Bootmem::release_all).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ReleaseSummary {
    /// Free pages found in the node windows.
    pub pages: u64,
    /// Pages that held the bitmaps themselves.
    pub bitmap_pages: u64,
}

impl ReleaseSummary {
    #[inline]
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pages + self.bitmap_pages
    }
}

impl fmt::Display for ReleaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pages released ({} free, {} bitmap)",
            self.total(),
            self.pages,
            self.bitmap_pages
        )
    }
}

/// Transfer `[start, end)` as the largest naturally aligned blocks that fit,
/// never above order `MAX_ORDER - 1`. Returns the number of pages.
pub fn release_pfn_range(sink: &mut impl PageSink, start: Pfn, end: Pfn) -> u64 {
    let mut pfn = start.as_u64();
    let end = end.as_u64();
    while pfn < end {
        let mut order = pfn.trailing_zeros().min(MAX_ORDER - 1);
        while pfn + (1 << order) > end {
            order -= 1;
        }
        sink.free_pages(Pfn::new(pfn), order);
        pfn += 1 << order;
    }
    end.saturating_sub(start.as_u64())
}
