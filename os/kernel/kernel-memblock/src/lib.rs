//! # Boot Region Tracker
//!
//! The first physical memory manager to run. It knows nothing but two sets of
//! address ranges:
//!
//! - **memory**: every range of physical RAM the platform described, and
//! - **reserved**: the sub-ranges already in use (kernel image, device tree,
//!   initrd, page tables, earlier allocations).
//!
//! Everything else follows from "memory minus reserved": placement queries
//! ([`Memblock::find_in_range`]), allocation ([`Memblock::alloc`]) and the
//! inputs for the boot bitmap allocator that takes over later.
//!
//! ## Region sets
//!
//! ```text
//!  memory    ┌──────────────────────────┐   ┌─────────────┐
//!            │ 0x8000_0000 +0x1000_0000 │   │ 0xa000_0000 │
//!            └──────────────────────────┘   └─────────────┘
//!  reserved      ┌──┐    ┌────┐                  ┌──┐
//!                │K │    │DTB │                  │RD│
//!                └──┘    └────┘                  └──┘
//!  free      ┌───┐  ┌────┐    ┌────────────┐ ┌───┐  ┌──┐
//! ```
//!
//! Each [`RegionSet`] is kept sorted by base address, never contains two
//! overlapping regions, and is fully merged after every change: neighbours
//! that touch and carry the same node tag become one region. Adding a range
//! that overlaps existing regions yields their union; removing a range splits
//! any region straddling its boundaries.
//!
//! ## Growth
//!
//! A set starts with [`INIT_MEMBLOCK_REGIONS`](kernel_info::memory::INIT_MEMBLOCK_REGIONS)
//! inline slots. When a change needs more, the tracker allocates a new array
//! twice the size *from itself*: it searches free memory, copies the slots,
//! releases the old array if it was itself allocated, and finally reserves the
//! new one. When the reserved set is the one growing, the range that is about
//! to be reserved is excluded from the search. Growth is refused until
//! [`Memblock::allow_resize`] and again after [`Memblock::freeze`].
//!
//! ## Example
//!
//! ```rust
//! use kernel_memblock::{ALLOC_ANYWHERE, Memblock};
//! use kernel_memory_addresses::{DirectMapper, PhysicalAddress};
//!
//! let mapper = DirectMapper::identity();
//! let mut mb = Memblock::new(&mapper);
//! mb.add(PhysicalAddress::new(0x2000_0000), 0x8000_0000).unwrap();
//! mb.reserve(PhysicalAddress::new(0x2000_8000), 0x10_0000).unwrap();
//!
//! let found = mb
//!     .find_in_range(PhysicalAddress::zero(), ALLOC_ANYWHERE, 0x1000, 0x1000)
//!     .unwrap();
//! assert_eq!(found, PhysicalAddress::new(0x9fff_f000));
//! assert!(!mb.is_region_reserved(found, 0x1000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod error;
mod free_range;
mod memblock;
mod region;
mod region_set;

pub use error::MemblockError;
pub use free_range::{FreeRange, FreeRanges, FreeRangesRev, PfnRange};
pub use memblock::{ALLOC_ACCESSIBLE, ALLOC_ANYWHERE, Memblock};
pub use region::{Region, RegionKind};
pub use region_set::{DumpEntry, RegionSet};
