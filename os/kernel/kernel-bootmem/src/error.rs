use kernel_memory_addresses::Pfn;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootmemError {
    /// An exclusive reservation hit a page that was already reserved.
    /// Nothing the call had marked stays reserved.
    #[error("page frame {pfn} is already reserved")]
    Busy { pfn: Pfn },
}
