//! # RAM Bank Table
//!
//! The banks reported by the platform, sorted, split at the low-memory ceiling
//! and tagged as low or high memory. Only low memory is directly mapped and
//! covered by the boot bitmap allocator.
//!
//! ```text
//!            bank 0         bank 1                  bank 2
//!        ├──────────┤   ├──────────────┼─────────┤   ├─────────┤
//!                                      │
//!        low memory ◄──────────────────┼──────────► high memory
//!                              lowmem ceiling
//! ```

use core::fmt;

use kernel_info::boot::PhysRange;
use kernel_info::memory::{NR_BANKS, SECTION_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Pfn, align_down};
use log::{error, warn};

use crate::error::EarlyMemError;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MemBank {
    pub range: PhysRange,
    pub highmem: bool,
}

impl MemBank {
    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.range.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.range.end()
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.range.size
    }

    /// Page frame containing the first byte.
    #[inline]
    #[must_use]
    pub const fn pfn_start(&self) -> Pfn {
        Pfn::down(self.start())
    }

    #[inline]
    #[must_use]
    pub const fn pfn_end(&self) -> Pfn {
        Pfn::down(self.end())
    }
}

impl fmt::Display for MemBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#010x}-{:#010x}] {}",
            self.start(),
            self.end().saturating_sub(1),
            if self.highmem { "highmem" } else { "lowmem" }
        )
    }
}

/// Boundaries derived by [`MemInfo::sanity_check`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Limits {
    /// End of the highest low-memory bank.
    pub lowmem_limit: PhysicalAddress,
    /// Ceiling for early region tracker allocations: the first bank boundary
    /// that is not section aligned, rounded down, or `lowmem_limit`.
    pub memblock_limit: PhysicalAddress,
}

/// Page frame boundaries of the bank table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PfnLimits {
    /// First frame of the first bank.
    pub min: Pfn,
    /// End of the last low-memory bank.
    pub max_low: Pfn,
    /// End of the last bank.
    pub max_high: Pfn,
}

#[derive(Copy, Clone)]
pub struct MemInfo {
    banks: [MemBank; NR_BANKS],
    nr: usize,
}

impl Default for MemInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemInfo {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            banks: [MemBank {
                range: PhysRange::new(0, 0),
                highmem: false,
            }; NR_BANKS],
            nr: 0,
        }
    }

    /// Build a sorted table from the platform's banks. Empty banks are skipped.
    ///
    /// # Errors
    /// [`EarlyMemError::TooManyBanks`] past [`NR_BANKS`] entries and
    /// [`EarlyMemError::OverlappingBanks`] if two banks share an address.
    pub fn from_banks(ranges: &[PhysRange]) -> Result<Self, EarlyMemError> {
        let mut mi = Self::new();
        for &range in ranges.iter().filter(|r| !r.is_empty()) {
            mi.push(MemBank {
                range,
                highmem: false,
            })?;
        }

        mi.banks[..mi.nr].sort_unstable_by_key(|b| b.start());
        for pair in mi.banks().windows(2) {
            if pair[0].end() > pair[1].start() {
                return Err(EarlyMemError::OverlappingBanks(pair[0].range, pair[1].range));
            }
        }
        Ok(mi)
    }

    fn push(&mut self, bank: MemBank) -> Result<(), EarlyMemError> {
        let slot = self
            .banks
            .get_mut(self.nr)
            .ok_or(EarlyMemError::TooManyBanks { max: NR_BANKS })?;
        *slot = bank;
        self.nr += 1;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn banks(&self) -> &[MemBank] {
        &self.banks[..self.nr]
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nr
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nr == 0
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.banks().iter().map(MemBank::size).sum()
    }

    /// Keep only the first `limit` bytes of RAM (`mem=`).
    pub fn limit_total(&mut self, limit: u64) {
        let mut left = limit;
        let mut keep = 0;
        for bank in &mut self.banks[..self.nr] {
            if left == 0 {
                break;
            }
            bank.range.size = bank.range.size.min(left);
            left -= bank.range.size;
            keep += 1;
        }
        self.nr = keep;
    }

    /// Classify banks against the low-memory ceiling `vmalloc_limit`.
    ///
    /// Banks at or above the ceiling become high memory. A bank crossing it is
    /// split in two when `allow_highmem` is set and truncated otherwise;
    /// without high memory, banks above the ceiling are dropped.
    pub fn sanity_check(&mut self, vmalloc_limit: PhysicalAddress, allow_highmem: bool) -> Limits {
        let input = *self;
        self.nr = 0;

        let mut highmem = false;
        let mut lowmem_limit = PhysicalAddress::zero();
        let mut memblock_limit = PhysicalAddress::zero();

        for (i, &orig) in input.banks().iter().enumerate() {
            let mut bank = orig;
            let mut size_limit = bank.size();
            if bank.start() >= vmalloc_limit {
                highmem = true;
            } else {
                size_limit = vmalloc_limit - bank.start();
            }
            bank.highmem = highmem;

            let mut upper = None;
            if allow_highmem {
                if !highmem && bank.size() > size_limit {
                    // every remaining input bank plus the upper half
                    if self.nr + (input.nr - i) >= NR_BANKS {
                        error!("NR_BANKS too low, ignoring high memory");
                    } else {
                        upper = Some(MemBank {
                            range: PhysRange {
                                start: vmalloc_limit,
                                size: bank.size() - size_limit,
                            },
                            highmem: true,
                        });
                        highmem = true;
                    }
                    bank.range.size = size_limit;
                }
            } else {
                if highmem {
                    warn!("Ignoring RAM at {bank} (high memory disabled)");
                    continue;
                }
                if bank.size() > size_limit {
                    warn!(
                        "Truncating RAM at {bank} to -{:#010x} (vmalloc region overlap)",
                        bank.start() + (size_limit - 1)
                    );
                    bank.range.size = size_limit;
                }
            }

            if !bank.highmem {
                let bank_end = bank.end();
                lowmem_limit = lowmem_limit.max(bank_end);

                if memblock_limit.is_null() {
                    if !bank.start().is_aligned(SECTION_SIZE) {
                        memblock_limit = bank.start();
                    } else if !bank_end.is_aligned(SECTION_SIZE) {
                        memblock_limit = bank_end;
                    }
                }
            }

            self.banks[self.nr] = bank;
            self.nr += 1;
            if let Some(upper) = upper {
                self.banks[self.nr] = upper;
                self.nr += 1;
            }
        }

        let memblock_limit = if memblock_limit.is_null() {
            lowmem_limit
        } else {
            PhysicalAddress::new(align_down(memblock_limit.as_u64(), SECTION_SIZE))
        };

        Limits {
            lowmem_limit,
            memblock_limit,
        }
    }

    /// Frame boundaries, `None` unless the first bank is low memory.
    #[must_use]
    pub fn find_limits(&self) -> Option<PfnLimits> {
        let banks = self.banks();
        let first = banks.first().filter(|b| !b.highmem)?;
        let low = banks.iter().take_while(|b| !b.highmem).last()?;
        let last = banks.last()?;
        Some(PfnLimits {
            min: first.pfn_start(),
            max_low: low.pfn_end(),
            max_high: last.pfn_end(),
        })
    }
}

impl fmt::Debug for MemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.banks()).finish()
    }
}

impl fmt::Display for MemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, bank) in self.banks().iter().enumerate() {
            writeln!(f, " bank[{i}] {bank}")?;
        }
        Ok(())
    }
}
