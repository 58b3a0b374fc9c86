//! # Memory Layout

use kernel_memory_addresses::{PAGE_SIZE, PageSize, Size2M};

/// Number of region slots each boot region set starts out with.
///
/// The slots live inside the tracker itself; once a set outgrows them the
/// array is moved into tracked memory and doubled.
pub const INIT_MEMBLOCK_REGIONS: usize = 128;

/// Highest number of memory nodes the boot allocators keep state for.
pub const MAX_NUMNODES: usize = 4;

/// Index of a memory node, always below [`MAX_NUMNODES`].
pub type NodeId = u16;

/// Largest buddy order plus one; freed blocks are at most `1 << (MAX_ORDER - 1)` pages.
pub const MAX_ORDER: u32 = 11;

/// Cache line size used for bookkeeping allocations.
pub const L1_CACHE_BYTES: u64 = 64;

/// Allocations from the `*_low` helpers stay below this address.
pub const ARCH_LOW_ADDRESS_LIMIT: u64 = 0xffff_ffff;

/// Granule of a section mapping. Low memory must end on such a boundary
/// for the early page tables to cover it.
pub const SECTION_SIZE: u64 = Size2M::SIZE;

/// Default physical ceiling of directly mapped (low) memory.
/// Everything above belongs to high memory and is never handed to the
/// boot bitmap allocator.
pub const VMALLOC_MIN_PHYS: u64 = 0x3000_0000;

/// Default allocation alignment when callers pass zero.
pub const SMP_CACHE_BYTES: u64 = 8;

/// Maximum number of RAM banks in a boot description.
pub const NR_BANKS: usize = 16;

const _: () = {
    assert!(INIT_MEMBLOCK_REGIONS.is_power_of_two());
    assert!(L1_CACHE_BYTES.is_power_of_two());
    assert!(VMALLOC_MIN_PHYS.is_multiple_of(SECTION_SIZE));
    assert!(SECTION_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(MAX_ORDER > 0 && MAX_ORDER < 20);
};
