use core::fmt;
use kernel_info::memory::NodeId;
use kernel_memory_addresses::PhysicalAddress;

/// Which of the two region sets a region belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RegionKind {
    /// Physical memory that exists.
    Memory,
    /// Sub-ranges that are already spoken for.
    Reserved,
}

impl RegionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Reserved => "reserved",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical address range `[base, base + size)` with an optional node tag.
///
/// A size of zero only ever appears in unused slots of a region array.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Region {
    pub(crate) base: PhysicalAddress,
    pub(crate) size: u64,
    pub(crate) node: Option<NodeId>,
}

impl Region {
    /// Value of an unused array slot.
    pub const EMPTY: Self = Self::new(PhysicalAddress::zero(), 0, None);

    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, size: u64, node: Option<NodeId>) -> Self {
        Self { base, size, node }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// Whether `[base, base + size)` intersects this region.
    #[inline]
    #[must_use]
    pub fn overlaps(&self, base: PhysicalAddress, size: u64) -> bool {
        base.as_u64() < self.end().as_u64()
            && self.base.as_u64() < base.as_u64().saturating_add(size)
    }

    /// Whether `nid` selects this region. `None` selects every region.
    #[inline]
    #[must_use]
    pub fn matches_node(&self, nid: Option<NodeId>) -> bool {
        nid.is_none() || nid == self.node
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}-{:#x})", self.base, self.end())?;
        if let Some(nid) = self.node {
            write!(f, "@{nid}")?;
        }
        Ok(())
    }
}
