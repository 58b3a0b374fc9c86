//! # Early Memory Bring-Up
//!
//! Drives the two boot allocators through the boot sequence of a machine with
//! a direct-mapped low-memory window:
//!
//! 1. **[`EarlyMemory::memblock_init`]**: the RAM banks are sorted, checked
//!    against the low-memory ceiling ([`MemInfo::sanity_check`]) and added to
//!    the region tracker. The kernel image, initrd, device tree, its reserve
//!    map and platform carve-outs are reserved. A platform hook may
//!    [`steal`](EarlyMemory::steal) memory from the map at this point.
//! 2. **[`EarlyMemory::bootmem_init`]**: a bitmap for low memory is taken from
//!    the tracker, free memory is released into it and reservations are
//!    copied over.
//! 3. **[`EarlyMemory::handoff`]**: every free page, low and high, goes to the
//!    page allocator. Both boot allocators are retired.
//!
//! ```text
//!   banks ──► MemInfo ──► Memblock ──► Bootmem ──► PageSink
//!             (lowmem     (memory,     (one bit     (buddy
//!              split)      reserved)    per page)    allocator)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use kernel_early_mm::EarlyMemory;
//! use kernel_info::boot::{BootMemoryInfo, PhysRange};
//! use kernel_memory_addresses::Pfn;
//! use sim_ram::SimulatedRam;
//!
//! let ram = SimulatedRam::new(0x2000_0000, 0x40_0000).unwrap();
//! let banks = [PhysRange::new(0x2000_0000, 0x40_0000)];
//! let info = BootMemoryInfo {
//!     banks: &banks,
//!     kernel: PhysRange::new(0x2000_8000, 0x10_0000),
//!     ..BootMemoryInfo::default()
//! };
//!
//! // SAFETY: the simulated window backs the only bank.
//! let mut mm = unsafe { EarlyMemory::new(&ram) };
//! mm.memblock_init(&info).unwrap();
//! mm.bootmem_init().unwrap();
//!
//! let mut pages = 0;
//! let summary = mm.handoff(&mut |_: Pfn, order: u32| pages += 1u64 << order).unwrap();
//! assert_eq!(pages, summary.total_pages());
//! assert_eq!(summary.total_pages(), 1024 - 256);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod early;
mod error;
mod meminfo;

pub use early::{EarlyMemory, HandoffSummary, Phase};
pub use error::EarlyMemError;
pub use meminfo::{Limits, MemBank, MemInfo, PfnLimits};
