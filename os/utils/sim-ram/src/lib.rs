//! # Simulated Physical RAM
//!
//! A window of page-aligned host memory that pretends to live at a given
//! physical address. It implements [`PhysMapper`], so the boot allocators can
//! grow their region arrays, place bitmaps and zero allocations exactly as they
//! would on hardware.
//!
//! ```rust
//! use kernel_memory_addresses::{PhysMapper, PhysicalAddress};
//! use sim_ram::SimulatedRam;
//!
//! let ram = SimulatedRam::new(0x8000_0000, 0x10_0000).unwrap();
//! let pa = PhysicalAddress::new(0x8000_1000);
//! ram.fill(pa, 8, 0xff);
//! unsafe { ram.zero(pa, 4) };
//! assert_eq!(ram.read_byte(pa), 0);
//! assert_eq!(ram.read_byte(pa + 4), 0xff);
//! ```
//!
//! Accesses outside the window panic: on a real machine they would touch
//! memory nobody described to the allocator.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use kernel_memory_addresses::{PAGE_SIZE, PhysMapper, PhysicalAddress};
use log::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SimRamError {
    #[error("window base {0:#x} is not page aligned")]
    UnalignedBase(u64),
    #[error("window length {0:#x} is not a non-zero multiple of the page size")]
    BadLength(u64),
    #[error("window does not fit the host address space")]
    TooLarge,
}

/// Host memory standing in for `[base, base + len)` of physical RAM.
pub struct SimulatedRam {
    base: PhysicalAddress,
    len: u64,
    host: NonNull<u8>,
    layout: Layout,
}

impl SimulatedRam {
    /// Allocate a zero-filled window.
    ///
    /// # Errors
    /// Fails if the window is not page aligned or cannot be represented on the host.
    pub fn new(base: u64, len: u64) -> Result<Self, SimRamError> {
        if !base.is_multiple_of(PAGE_SIZE) {
            return Err(SimRamError::UnalignedBase(base));
        }
        if len == 0 || !len.is_multiple_of(PAGE_SIZE) {
            return Err(SimRamError::BadLength(len));
        }
        base.checked_add(len).ok_or(SimRamError::TooLarge)?;

        let size = usize::try_from(len).map_err(|_| SimRamError::TooLarge)?;
        let align = usize::try_from(PAGE_SIZE).map_err(|_| SimRamError::TooLarge)?;
        let layout = Layout::from_size_align(size, align).map_err(|_| SimRamError::TooLarge)?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(host) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };

        debug!("simulated RAM at [{base:#x}-{:#x}]", base + len - 1);
        Ok(Self {
            base: PhysicalAddress::new(base),
            len,
            host,
            layout,
        })
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last simulated byte.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.base + self.len
    }

    /// Whether `[pa, pa + len)` is backed by the window.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress, len: u64) -> bool {
        pa >= self.base && pa.checked_add(len).is_some_and(|end| end <= self.end())
    }

    /// Overwrite `len` bytes at `pa` with `byte`, e.g. to poison memory
    /// before checking that an allocator zeroes it.
    pub fn fill(&self, pa: PhysicalAddress, len: u64, byte: u8) {
        let ptr = self.host_ptr(pa, len);
        // SAFETY: the range is inside the window; no references are handed out here.
        unsafe { ptr.write_bytes(byte, self.host_len(len)) };
    }

    #[must_use]
    pub fn read_byte(&self, pa: PhysicalAddress) -> u8 {
        // SAFETY: the byte is inside the window.
        unsafe { self.host_ptr(pa, 1).read() }
    }

    /// Whether every byte of `[pa, pa + len)` equals `byte`.
    #[must_use]
    pub fn all_bytes_are(&self, pa: PhysicalAddress, len: u64, byte: u8) -> bool {
        let ptr = self.host_ptr(pa, len);
        // SAFETY: the range is inside the window and initialized.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, self.host_len(len)) };
        bytes.iter().all(|&b| b == byte)
    }

    fn host_len(&self, len: u64) -> usize {
        let Ok(len) = usize::try_from(len) else {
            panic!("length {len:#x} exceeds the simulated window");
        };
        len
    }

    fn host_ptr(&self, pa: PhysicalAddress, len: u64) -> *mut u8 {
        assert!(
            self.contains(pa, len),
            "access to [{pa:#x}+{len:#x}] outside simulated RAM [{:#x}-{:#x})",
            self.base,
            self.end()
        );
        let offset = self.host_len(pa - self.base);
        // SAFETY: offset is within the allocation.
        unsafe { self.host.as_ptr().add(offset) }
    }
}

impl PhysMapper for SimulatedRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.host_ptr(pa, size_of::<T>() as u64).cast::<T>();
        debug_assert!(ptr.is_aligned(), "misaligned access at {pa:#x}");
        // SAFETY: Caller guarantees exclusivity and a valid `T` at `pa`.
        unsafe { &mut *ptr }
    }

    unsafe fn phys_to_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T] {
        let bytes = (size_of::<T>() * len) as u64;
        let ptr = self.host_ptr(pa, bytes).cast::<T>();
        debug_assert!(ptr.is_aligned(), "misaligned access at {pa:#x}");
        // SAFETY: Caller guarantees exclusivity and valid `T`s in the range.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }
}

impl Drop for SimulatedRam {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.host.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_windows() {
        assert_eq!(
            SimulatedRam::new(0x1001, PAGE_SIZE).err(),
            Some(SimRamError::UnalignedBase(0x1001))
        );
        assert_eq!(
            SimulatedRam::new(0x1000, 0).err(),
            Some(SimRamError::BadLength(0))
        );
        assert_eq!(
            SimulatedRam::new(u64::MAX & !0xfff, PAGE_SIZE).err(),
            Some(SimRamError::TooLarge)
        );
    }

    #[test]
    fn maps_words_at_physical_offsets() {
        let ram = SimulatedRam::new(0x4000_0000, 4 * PAGE_SIZE).unwrap();
        let pa = PhysicalAddress::new(0x4000_2008);

        // SAFETY: 16 bytes inside the window, nothing else borrows them.
        unsafe {
            let words: &mut [u64] = ram.phys_to_slice_mut(pa, 2);
            words[0] = 0x1122_3344_5566_7788;
            words[1] = u64::MAX;
        }

        assert_eq!(ram.read_byte(pa), 0x88);
        assert!(ram.all_bytes_are(pa + 8, 8, 0xff));
        assert!(ram.all_bytes_are(ram.base(), 0x2000, 0));
    }

    #[test]
    #[should_panic(expected = "outside simulated RAM")]
    fn out_of_window_access_panics() {
        let ram = SimulatedRam::new(0x4000_0000, PAGE_SIZE).unwrap();
        let _ = ram.read_byte(PhysicalAddress::new(0x4000_1000));
    }
}
