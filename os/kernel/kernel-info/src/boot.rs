//! # Boot Memory Information

use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// A contiguous physical range handed over by the boot environment.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysRange {
    /// First byte of the range.
    pub start: PhysicalAddress,
    /// Length of the range in **bytes**.
    pub size: u64,
}

impl PhysRange {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            size,
        }
    }

    /// One past the last byte; saturates at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.start.saturating_add(self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Debug for PhysRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}-{:#x})", self.start, self.end())
    }
}

/// Everything the early memory code needs to know about the machine.
///
/// The platform layer (device-tree walker, firmware tables, ...) fills this in
/// before the first boot allocator exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootMemoryInfo<'a> {
    /// RAM banks in any order; they may not overlap.
    pub banks: &'a [PhysRange],

    /// Kernel text, data and bss.
    pub kernel: PhysRange,

    /// The flattened device-tree blob, if one was passed.
    pub dtb: Option<PhysRange>,

    /// Entries of the device-tree memory reserve map.
    pub dtb_reserve_map: &'a [PhysRange],

    /// Initial ramdisk as reported by the boot loader.
    pub initrd: Option<PhysRange>,

    /// Platform carve-outs (firmware, secure world, frame buffers).
    pub platform_reserved: &'a [PhysRange],

    /// Kernel command line, see [`BootParams`](crate::params::BootParams).
    pub cmdline: &'a str,
}
