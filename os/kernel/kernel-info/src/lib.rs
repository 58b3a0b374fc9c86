//! # Early Memory Configuration and Boot Interface
//!
//! This crate holds the compile-time limits and the boot-time description of
//! physical memory that the early memory managers are configured from. It is
//! the single place where "how many", "how big" and "where" are decided.
//!
//! ## Architecture
//!
//! ### Memory Constants ([`memory`])
//! * **Tracker sizing**: initial region slots per set
//! * **Node limits**: number of memory nodes kept by the bitmap allocator
//! * **Low memory**: default ceiling of the direct-mapped window and its
//!   section granule
//!
//! ### Boot Information ([`boot`])
//! * **RAM banks** as discovered by the platform
//! * **Fixed reservations**: kernel image, device tree, initrd, carve-outs
//!
//! ### Boot Parameters ([`params`])
//! * `mem=`, `initrd=`, `memblock=debug`, `bootmem_debug`, `nohighmem`
//!
//! ## Early Memory Flow
//!
//! ```text
//!  BootMemoryInfo ──► region tracker ──► boot bitmap ──► page allocator
//!  (banks, fixed       memory set         one bit per      (receives every
//!   reservations)      reserved set       low page         page still free)
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │   (page 0, never allocated)     │
//!             ├─────────────────────────────────┤ first bank
//!             │  Kernel image, DTB, initrd      │ ◄─ reserved up front
//!             │  Low memory                     │ ◄─ boot bitmap covers this
//! lowmem limit├─────────────────────────────────┤ ≤ VMALLOC_MIN_PHYS
//!             │  High memory                    │ ◄─ tracker only
//!             └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
pub mod params;
