//! # Physical Memory Access
//!
//! The boot allocators keep their own bookkeeping (grown region arrays,
//! allocation bitmaps) inside the very memory they manage, and they zero every
//! block they hand out. Both require dereferencing a *physical* address, which
//! is only possible through some mapping of it into the current address space.
//!
//! [`PhysMapper`] abstracts over that mapping:
//! - **Kernel**: a direct map at a fixed virtual offset ([`DirectMapper`]).
//! - **Tests / host tools**: a window of host memory standing in for RAM.

use crate::PhysicalAddress;

/// Converts physical addresses to usable pointers in the current
/// virtual address space.
///
/// # Safety
/// - Implementations must return pointers that are valid for reads and writes
///   of the requested extent for as long as the mapper itself is borrowed.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
pub trait PhysMapper {
    /// Map a single `T` at `pa`.
    ///
    /// # Safety
    /// `pa` must be mapped and writable, suitably aligned for `T`, hold a
    /// valid `T`, and not be aliased by any other live reference.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Map `len` consecutive `T`s starting at `pa`.
    ///
    /// # Safety
    /// Same as [`phys_to_mut`](Self::phys_to_mut) for the entire range.
    unsafe fn phys_to_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T];

    /// Fill `len` bytes at `pa` with zeroes.
    ///
    /// # Safety
    /// The range must be mapped, writable and not referenced elsewhere.
    unsafe fn zero(&self, pa: PhysicalAddress, len: u64) {
        let Ok(len) = usize::try_from(len) else {
            panic!("cannot zero {len:#x} bytes at {pa}");
        };
        // SAFETY: the caller guarantees `[pa, pa + len)` is mapped and unaliased.
        let bytes = unsafe { self.phys_to_slice_mut::<u8>(pa, len) };
        bytes.fill(0);
    }
}

/// [`PhysMapper`] for kernels that map all physical memory at a fixed offset.
///
/// # Safety
/// - The direct map must be present and cover every physical range handed to
///   the boot allocators.
#[derive(Debug, Copy, Clone)]
pub struct DirectMapper {
    offset: u64,
}

impl DirectMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Physical memory is identity mapped.
    #[must_use]
    pub const fn identity() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    fn va<T>(&self, pa: PhysicalAddress) -> *mut T {
        self.offset.wrapping_add(pa.as_u64()) as *mut T
    }
}

impl PhysMapper for DirectMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: Caller must ensure the physical address is valid and mapped.
        unsafe { &mut *self.va::<T>(pa) }
    }

    unsafe fn phys_to_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T] {
        // SAFETY: Caller must ensure the whole range is valid and mapped.
        unsafe { core::slice::from_raw_parts_mut(self.va::<T>(pa), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Frame([u8; 4096]);

    #[test]
    fn direct_mapper_adds_offset() {
        let mut frame = Frame([0xAA; 4096]);
        let base = (&raw mut frame) as u64;
        // Pretend the frame lives at physical 0x10_0000.
        let mapper = DirectMapper::new(base.wrapping_sub(0x10_0000));

        // SAFETY: both accesses stay inside `frame`.
        unsafe {
            mapper.zero(PhysicalAddress::new(0x10_0010), 16);
            let word: &mut u32 = mapper.phys_to_mut(PhysicalAddress::new(0x10_0000));
            assert_eq!(*word, 0xAAAA_AAAA);
        }

        assert!(frame.0[0x10..0x20].iter().all(|&b| b == 0));
        assert_eq!(frame.0[0x20], 0xAA);
    }
}
