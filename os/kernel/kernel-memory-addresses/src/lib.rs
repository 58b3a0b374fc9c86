//! # Physical Address Types
//!
//! Strongly typed wrappers for the raw physical addresses and page frame
//! numbers handled by the early memory managers.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A raw 64-bit physical address (RAM or MMIO). |
//! | [`Pfn`] | A page frame number, i.e. a physical address shifted by [`PAGE_SHIFT`]. |
//! | [`PageSize`] | Marker trait for the supported page granules. |
//! | [`PhysMapper`] | Turns a physical address into something the CPU can dereference. |
//!
//! Sizes and lengths are plain `u64` byte counts; only *positions* in the
//! physical address space get a dedicated type. This keeps interval arithmetic
//! readable while still preventing page frame numbers from being mixed up with
//! byte addresses.
//!
//! ## Rounding
//!
//! Page frame conversion comes in two flavours that mirror how ranges are
//! treated by the boot allocators:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x1234);
//! assert_eq!(Pfn::down(pa).as_u64(), 1); // pages that *contain* the address
//! assert_eq!(Pfn::up(pa).as_u64(), 2);   // first page fully *after* it
//! assert_eq!(Pfn::new(2).base(), PhysicalAddress::new(0x2000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod phys_mapper;

use core::fmt;
use core::hash::Hash;
use core::ops::{Add, AddAssign, Sub};

pub use phys_mapper::{DirectMapper, PhysMapper};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
}

/// 4 KiB page, the granule of every page frame number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
}

/// 2 MiB block, the granule of a section mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;
}

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow;
/// use [`checked_align_up`] near the top of the address space.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Like [`align_up`], but returns `None` instead of wrapping.
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of bytes in whole pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn page_align(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE)
}

/// Physical memory address.
///
/// Carries intent only; no validation is performed. Arithmetic with `u64`
/// offsets panics on overflow in debug builds like the underlying integer.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x8000_1234);
/// assert_eq!(pa.align_down(PAGE_SIZE).as_u64(), 0x8000_1000);
/// assert_eq!(pa.align_up(PAGE_SIZE).as_u64(), 0x8000_2000);
/// assert_eq!((pa + 0x10) - pa, 0x10);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// The highest representable physical address.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Align down to a multiple of `align` (power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(align_down(self.0, align))
    }

    /// Align up to a multiple of `align` (power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self(align_up(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Offset within a page of size `S`.
    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: u64) -> Self {
        Self(self.0.saturating_add(rhs))
    }

    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: u64) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// Distance in bytes between two addresses.
impl Sub<Self> for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(a: PhysicalAddress) -> Self {
        a.as_u64()
    }
}

/// Page frame number of a 4 KiB page.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Frame that contains `pa` (rounds down).
    #[inline]
    #[must_use]
    pub const fn down(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() >> PAGE_SHIFT)
    }

    /// First frame starting at or after `pa` (rounds up).
    #[inline]
    #[must_use]
    pub const fn up(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64().div_ceil(PAGE_SIZE))
    }

    /// Physical address of the first byte of this frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, frames: u64) -> bool {
        self.0 & (frames - 1) == 0
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<u64> for Pfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Pfn {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Number of frames between two frame numbers.
impl Sub<Self> for Pfn {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<PhysicalAddress> for Pfn {
    #[inline]
    fn from(pa: PhysicalAddress) -> Self {
        Self::down(pa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pfn_rounding() {
        assert_eq!(Pfn::down(PhysicalAddress::new(0x1fff)), Pfn::new(1));
        assert_eq!(Pfn::up(PhysicalAddress::new(0x1001)), Pfn::new(2));
        assert_eq!(Pfn::up(PhysicalAddress::new(0x2000)), Pfn::new(2));
        assert_eq!(Pfn::up(PhysicalAddress::MAX), Pfn::new(1 << 52));
    }

    #[test]
    fn alignment_helpers() {
        let a = PhysicalAddress::new(0x12345);
        assert_eq!(a.align_down(PAGE_SIZE).as_u64(), 0x12000);
        assert_eq!(a.align_up(PAGE_SIZE).as_u64(), 0x13000);
        assert_eq!(a.page_offset::<Size4K>(), 0x345);
        assert!(!a.is_aligned(8));
        assert!(PhysicalAddress::new(0x40_0000).is_aligned(Size2M::SIZE));
    }

    #[test]
    fn checked_align_up_reports_overflow() {
        assert_eq!(checked_align_up(u64::MAX - 10, PAGE_SIZE), None);
        assert_eq!(checked_align_up(0x1001, PAGE_SIZE), Some(0x2000));
        assert_eq!(PhysicalAddress::MAX.checked_add(1), None);
    }

    #[test]
    fn address_distance() {
        let a = PhysicalAddress::new(0x8000);
        let b = a + 0x1800;
        assert_eq!(b - a, 0x1800);
        assert_eq!(Pfn::up(b) - Pfn::down(a), 2);
        assert_eq!(page_align(1), PAGE_SIZE);
    }
}
