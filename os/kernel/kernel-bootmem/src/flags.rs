use bitfield_struct::bitfield;

/// Flag word for [`Bootmem::reserve`](crate::Bootmem::reserve).
#[bitfield(u32)]
pub struct ReserveFlags {
    /// Bit 0: fail with [`BootmemError::Busy`](crate::BootmemError::Busy)
    /// instead of accepting pages that are already reserved.
    pub exclusive: bool,

    /// Bits 1-31: reserved, must be 0.
    #[bits(31, default = 0)]
    _reserved_1_31: u32,
}

impl ReserveFlags {
    /// Overlap with existing reservations is tolerated and logged.
    pub const DEFAULT: Self = Self::new();

    /// All pages must have been free.
    pub const EXCLUSIVE: Self = Self::new().with_exclusive(true);
}
