use kernel_bootmem::BootmemError;
use kernel_info::boot::PhysRange;
use kernel_info::params::BootParamError;
use kernel_memblock::MemblockError;

use crate::early::Phase;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum EarlyMemError {
    #[error("invalid boot parameters: {0}")]
    Params(#[from] BootParamError),
    #[error(transparent)]
    Memblock(#[from] MemblockError),
    #[error(transparent)]
    Bootmem(#[from] BootmemError),
    #[error("more than {max} RAM banks")]
    TooManyBanks { max: usize },
    #[error("RAM banks {0:?} and {1:?} overlap")]
    OverlappingBanks(PhysRange, PhysRange),
    #[error("no usable RAM")]
    NoMemory,
    #[error("failed to allocate {size:#x} bytes")]
    OutOfMemory { size: u64 },
    #[error("memory can only be stolen while the region tracker is being set up")]
    StealNotPermitted,
    #[error("{operation} is not allowed in the {phase} phase")]
    WrongPhase {
        operation: &'static str,
        phase: Phase,
    },
}
