use core::fmt;

use kernel_bootmem::{
    Bootmem, PageSink, ReleaseSummary, ReserveFlags, bootmap_pages, release_pfn_range,
};
use kernel_info::boot::{BootMemoryInfo, PhysRange};
use kernel_info::memory::{SMP_CACHE_BYTES, VMALLOC_MIN_PHYS};
use kernel_info::params::BootParams;
use kernel_memblock::{ALLOC_ANYWHERE, Memblock};
use kernel_memory_addresses::{
    PAGE_SHIFT, PAGE_SIZE, PhysMapper, PhysicalAddress, Pfn, checked_align_up,
};
use log::{debug, error, info};

use crate::error::EarlyMemError;
use crate::meminfo::{Limits, MemInfo, PfnLimits};

/// Where the boot sequence currently stands.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Phase {
    /// Nothing registered yet.
    Start,
    /// The region tracker owns physical memory.
    Tracker,
    /// The boot bitmap allocator owns low memory.
    Bitmap,
    /// Every free page went to the page allocator.
    HandedOff,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Tracker => "region tracker",
            Self::Bitmap => "boot bitmap",
            Self::HandedOff => "handed off",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`EarlyMemory::handoff`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HandoffSummary {
    /// Pages released by the boot bitmap allocator.
    pub lowmem: ReleaseSummary,
    /// Free pages above the low-memory ceiling.
    pub highmem_pages: u64,
    /// Bytes of RAM known to the region tracker.
    pub ram_bytes: u64,
}

impl HandoffSummary {
    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.lowmem.total() + self.highmem_pages
    }

    #[must_use]
    pub const fn available_bytes(&self) -> u64 {
        self.total_pages() << PAGE_SHIFT
    }
}

impl fmt::Display for HandoffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let available = self.available_bytes();
        write!(
            f,
            "{}K/{}K available, {}K reserved, {}K highmem",
            available >> 10,
            self.ram_bytes >> 10,
            self.ram_bytes.saturating_sub(available) >> 10,
            (self.highmem_pages << PAGE_SHIFT) >> 10
        )
    }
}

/// The early memory bring-up: region tracker first, then the boot bitmap
/// allocator for low memory, then the handoff to the page allocator.
///
/// ```text
///  new ──► memblock_init ──► bootmem_init ──► handoff
///  Start    Tracker           Bitmap           HandedOff
/// ```
pub struct EarlyMemory<'m, M: PhysMapper> {
    memblock: Memblock<'m, M>,
    bootmem: Bootmem<'m, M>,
    meminfo: MemInfo,
    params: BootParams,
    limits: Limits,
    pfn_limits: Option<PfnLimits>,
    initrd: Option<PhysRange>,
    steal_permitted: bool,
    phase: Phase,
}

impl<'m, M: PhysMapper> EarlyMemory<'m, M> {
    /// # Safety
    /// `mapper` must reach every RAM bank later passed to
    /// [`memblock_init`](Self::memblock_init), and nothing else may use that
    /// memory while `'m` lasts, except through the allocators held here.
    #[must_use]
    pub const unsafe fn new(mapper: &'m M) -> Self {
        Self {
            memblock: Memblock::new(mapper),
            bootmem: Bootmem::new(mapper),
            meminfo: MemInfo::new(),
            params: BootParams {
                mem_limit: None,
                initrd: None,
                memblock_debug: false,
                bootmem_debug: false,
                no_highmem: false,
            },
            limits: Limits {
                lowmem_limit: PhysicalAddress::zero(),
                memblock_limit: PhysicalAddress::zero(),
            },
            pfn_limits: None,
            initrd: None,
            steal_permitted: false,
            phase: Phase::Start,
        }
    }

    #[inline]
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    #[must_use]
    pub const fn memblock(&self) -> &Memblock<'m, M> {
        &self.memblock
    }

    #[inline]
    pub const fn memblock_mut(&mut self) -> &mut Memblock<'m, M> {
        &mut self.memblock
    }

    #[inline]
    #[must_use]
    pub const fn bootmem(&self) -> &Bootmem<'m, M> {
        &self.bootmem
    }

    #[inline]
    pub const fn bootmem_mut(&mut self) -> &mut Bootmem<'m, M> {
        &mut self.bootmem
    }

    /// The bank table after the low-memory sanity check.
    #[inline]
    #[must_use]
    pub const fn meminfo(&self) -> &MemInfo {
        &self.meminfo
    }

    #[inline]
    #[must_use]
    pub const fn params(&self) -> &BootParams {
        &self.params
    }

    #[inline]
    #[must_use]
    pub const fn limits(&self) -> Limits {
        self.limits
    }

    /// Frame boundaries, known once the bitmap allocator is up.
    #[inline]
    #[must_use]
    pub const fn pfn_limits(&self) -> Option<PfnLimits> {
        self.pfn_limits
    }

    /// The initial ramdisk, unless it was rejected.
    #[inline]
    #[must_use]
    pub const fn initrd(&self) -> Option<PhysRange> {
        self.initrd
    }

    fn expect_phase(&self, want: Phase, operation: &'static str) -> Result<(), EarlyMemError> {
        if self.phase == want {
            Ok(())
        } else {
            Err(EarlyMemError::WrongPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    /// [`memblock_init_with`](Self::memblock_init_with) without a platform hook.
    ///
    /// # Errors
    /// See [`memblock_init_with`](Self::memblock_init_with).
    pub fn memblock_init(&mut self, info: &BootMemoryInfo<'_>) -> Result<(), EarlyMemError> {
        self.memblock_init_with(info, |_| Ok(()))
    }

    /// Register RAM with the region tracker and reserve everything already in
    /// use: kernel image, initrd, device tree and its reserve map, platform
    /// carve-outs. `reserve` then runs; it may [`steal`](Self::steal) memory
    /// and nothing else can.
    ///
    /// # Errors
    /// - [`EarlyMemError::WrongPhase`] unless called first.
    /// - [`EarlyMemError::Params`] for a malformed command line.
    /// - [`EarlyMemError::TooManyBanks`], [`EarlyMemError::OverlappingBanks`]
    ///   and [`EarlyMemError::NoMemory`] for a bad bank table.
    /// - Whatever the tracker or `reserve` report.
    pub fn memblock_init_with(
        &mut self,
        info: &BootMemoryInfo<'_>,
        reserve: impl FnOnce(&mut Self) -> Result<(), EarlyMemError>,
    ) -> Result<(), EarlyMemError> {
        self.expect_phase(Phase::Start, "memblock_init")?;

        let params = BootParams::parse(info.cmdline)?;
        self.memblock.set_debug(params.memblock_debug);
        self.bootmem.set_debug(params.bootmem_debug);

        let mut meminfo = MemInfo::from_banks(info.banks)?;
        if let Some(limit) = params.mem_limit {
            meminfo.limit_total(limit);
        }
        let limits = meminfo.sanity_check(
            PhysicalAddress::new(VMALLOC_MIN_PHYS),
            !params.no_highmem,
        );
        if meminfo.is_empty() {
            return Err(EarlyMemError::NoMemory);
        }
        for bank in meminfo.banks() {
            debug!("early-mm: RAM bank {bank}");
        }

        self.params = params;
        self.meminfo = meminfo;
        self.limits = limits;

        for bank in meminfo.banks() {
            self.memblock.add(bank.start(), bank.size())?;
        }
        self.memblock.set_current_limit(limits.memblock_limit);

        self.memblock.reserve(info.kernel.start, info.kernel.size)?;

        self.initrd = params
            .initrd
            .or(info.initrd)
            .filter(|rd| !rd.is_empty())
            .filter(|&rd| self.initrd_usable(rd));
        if let Some(rd) = self.initrd {
            self.memblock.reserve(rd.start, rd.size)?;
        }

        if let Some(dtb) = info.dtb {
            self.memblock.reserve(dtb.start, dtb.size)?;
        }
        for entry in info.dtb_reserve_map {
            self.memblock.reserve(entry.start, entry.size)?;
        }
        for carve_out in info.platform_reserved {
            self.memblock.reserve(carve_out.start, carve_out.size)?;
        }

        self.steal_permitted = true;
        let hooked = reserve(self);
        self.steal_permitted = false;
        hooked?;

        if let Some(limit) = params.mem_limit {
            self.memblock.enforce_memory_limit(limit)?;
        }

        self.memblock.allow_resize();
        self.memblock.dump_all();
        self.phase = Phase::Tracker;
        Ok(())
    }

    fn initrd_usable(&self, rd: PhysRange) -> bool {
        if !self.memblock.is_region_memory(rd.start, rd.size) {
            error!(
                "INITRD: {:#010x}+{:#010x} is not a memory region - disabling initrd",
                rd.start, rd.size
            );
            return false;
        }
        if self.memblock.is_region_reserved(rd.start, rd.size) {
            error!(
                "INITRD: {:#010x}+{:#010x} overlaps in-use memory region - disabling initrd",
                rd.start, rd.size
            );
            return false;
        }
        true
    }

    /// Take `size` bytes out of physical memory for good: the range is
    /// neither memory nor reserved afterwards, so no allocator ever sees it.
    ///
    /// # Errors
    /// - [`EarlyMemError::StealNotPermitted`] outside the reserve hook of
    ///   [`memblock_init_with`](Self::memblock_init_with).
    /// - [`EarlyMemError::OutOfMemory`] if nothing fits.
    pub fn steal(&mut self, size: u64, align: u64) -> Result<PhysicalAddress, EarlyMemError> {
        if !self.steal_permitted {
            return Err(EarlyMemError::StealNotPermitted);
        }

        let align = if align == 0 { SMP_CACHE_BYTES } else { align };
        let size = checked_align_up(size, align).ok_or(EarlyMemError::OutOfMemory { size })?;
        let pa = self
            .memblock
            .try_alloc_base(size, align, ALLOC_ANYWHERE)
            .ok_or(EarlyMemError::OutOfMemory { size })?;
        self.memblock.free(pa, size)?;
        self.memblock.remove(pa, size)?;

        info!("early-mm: stole {size:#x} bytes at {pa:#x}");
        Ok(pa)
    }

    /// Bring up the boot bitmap allocator over low memory.
    ///
    /// The bitmap comes from the region tracker below the low-memory ceiling.
    /// Low memory regions are then freed into it, whole pages only, and every
    /// page touched by a reservation is marked reserved again.
    ///
    /// # Errors
    /// - [`EarlyMemError::WrongPhase`] unless the tracker is set up.
    /// - [`EarlyMemError::NoMemory`] without low memory.
    /// - [`EarlyMemError::OutOfMemory`] if the bitmap does not fit.
    pub fn bootmem_init(&mut self) -> Result<(), EarlyMemError> {
        self.expect_phase(Phase::Tracker, "bootmem_init")?;

        let pfns = self.meminfo.find_limits().ok_or(EarlyMemError::NoMemory)?;
        let (min, max_low) = (pfns.min, pfns.max_low);

        let bytes = bootmap_pages(max_low - min) << PAGE_SHIFT;
        let map = self
            .memblock
            .try_alloc_base(bytes, PAGE_SIZE, max_low.base())
            .ok_or(EarlyMemError::OutOfMemory { size: bytes })?;

        // SAFETY: `new` guarantees the mapper reaches every bank, and the
        // bitmap pages were just reserved in the tracker.
        unsafe { self.bootmem.init_node(0, Pfn::down(map), min, max_low) };

        for region in self.memblock.memory() {
            let start = Pfn::up(region.base());
            let end = Pfn::down(region.end()).min(max_low);
            if start >= max_low {
                break;
            }
            if start < end {
                self.bootmem.free(start.base(), (end - start) << PAGE_SHIFT);
            }
        }

        for region in self.memblock.reserved() {
            let start = Pfn::down(region.base()).max(min);
            let end = Pfn::up(region.end()).min(max_low);
            if start >= max_low {
                break;
            }
            if start < end {
                self.bootmem.reserve(
                    start.base(),
                    (end - start) << PAGE_SHIFT,
                    ReserveFlags::DEFAULT,
                )?;
            }
        }

        info!(
            "early-mm: boot bitmap over pfn [{min}-{max_low}) at {map:#x}, {} pages free",
            self.bootmem.free_pages(0)
        );
        self.pfn_limits = Some(pfns);
        self.phase = Phase::Bitmap;
        Ok(())
    }

    /// Pass every free page to `sink`: low memory through the bitmap
    /// allocator (its own pages included), high memory straight from the
    /// region tracker. Both early allocators are retired afterwards.
    ///
    /// # Errors
    /// [`EarlyMemError::WrongPhase`] unless the bitmap allocator is up.
    pub fn handoff(&mut self, sink: &mut impl PageSink) -> Result<HandoffSummary, EarlyMemError> {
        self.expect_phase(Phase::Bitmap, "handoff")?;
        let pfns = self.pfn_limits.ok_or(EarlyMemError::NoMemory)?;

        let lowmem = self.bootmem.release_all(sink);

        let mut highmem_pages = 0;
        for range in self.memblock.free_ranges(None) {
            let start = Pfn::up(range.start).max(pfns.max_low);
            let end = Pfn::down(range.end).min(pfns.max_high);
            if start < end {
                highmem_pages += release_pfn_range(sink, start, end);
            }
        }

        self.memblock.freeze();

        let summary = HandoffSummary {
            lowmem,
            highmem_pages,
            ram_bytes: self.memblock.phys_mem_size(),
        };
        info!("Memory: {summary}");
        self.phase = Phase::HandedOff;
        Ok(summary)
    }
}

impl<M: PhysMapper> fmt::Debug for EarlyMemory<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EarlyMemory")
            .field("phase", &self.phase)
            .field("meminfo", &self.meminfo)
            .field("limits", &self.limits)
            .field("pfn_limits", &self.pfn_limits)
            .field("initrd", &self.initrd)
            .finish_non_exhaustive()
    }
}
