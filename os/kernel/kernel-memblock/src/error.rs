use crate::region::RegionKind;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemblockError {
    #[error("{kind} region array is full ({capacity} entries) and may not be resized yet")]
    ResizeNotAllowed { kind: RegionKind, capacity: usize },
    #[error("no free memory to grow {kind} region array from {from} to {to} entries")]
    ResizeFailed {
        kind: RegionKind,
        from: usize,
        to: usize,
    },
}
