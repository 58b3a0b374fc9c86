//! # Boot Bitmap Allocator
//!
//! The second early allocator. Once the region tracker has located room for
//! them, each memory node gets a bitmap with one bit per page frame in its
//! window: `1` for reserved, `0` for free. Every page starts reserved; the boot
//! sequence then frees the RAM it knows about and re-reserves what is in use.
//!
//! ```text
//!  node 0   min_pfn                                             low_pfn
//!           ├─────────────────────────────────────────────────────┤
//!  bitmap   1 1 1 0 0 0 0 1 1 0 0 0 0 0 0 0 0 0 1 1 1 0 0 0 0 0 0
//!                  ▲              ▲
//!                  free run       hint: next search starts here
//! ```
//!
//! ## Rounding
//!
//! [`Bootmem::free`] only releases pages that lie *entirely* inside the range,
//! while [`Bootmem::reserve`] claims every page the range *touches*. Partial
//! pages therefore always stay reserved.
//!
//! ## Allocation
//!
//! Searches find the first run of free pages large enough for the request,
//! aligned, at or above an optional goal and below an optional limit. They
//! resume where the previous allocation ended and rescan from the start when
//! that fails. Consecutive small allocations share the tail of a page. Every
//! returned block is zeroed.
//!
//! ## Handoff
//!
//! [`Bootmem::release_all`] passes every free page to a [`PageSink`] in the
//! largest naturally aligned blocks the buddy allocator accepts, then the
//! bitmap pages themselves. The nodes are dead afterwards; touching them
//! panics.
//!
//! ## Example
//!
//! ```rust
//! use kernel_bootmem::{Bootmem, ReserveFlags, bootmap_bytes};
//! use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn};
//! use sim_ram::SimulatedRam;
//!
//! let ram = SimulatedRam::new(0x8000_0000, 64 * PAGE_SIZE).unwrap();
//! let (min, low) = (Pfn::down(ram.base()), Pfn::down(ram.end()));
//!
//! let mut bm = Bootmem::new(&ram);
//! // SAFETY: the simulated window backs both the bitmap and the node.
//! let bytes = unsafe { bm.init_node(0, min, min, low) };
//! assert_eq!(bytes, bootmap_bytes(64));
//!
//! bm.free(ram.base(), ram.len());
//! bm.reserve(ram.base(), PAGE_SIZE, ReserveFlags::EXCLUSIVE).unwrap();
//!
//! let block = bm.alloc(100, 8, PhysicalAddress::zero());
//! assert_eq!(block, ram.base() + PAGE_SIZE);
//! assert_eq!(bm.free_pages(0), 62);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod bitmap;
mod bootmem;
mod error;
mod flags;
mod node;
mod release;
mod reserve_log;

pub use bitmap::PageBitmap;
pub use bootmem::{Bootmem, NodeInfo, bootmap_bytes, bootmap_pages};
pub use error::BootmemError;
pub use flags::ReserveFlags;
pub use release::{PageSink, ReleaseSummary, release_pfn_range};
