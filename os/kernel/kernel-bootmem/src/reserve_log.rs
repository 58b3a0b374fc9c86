use kernel_info::memory::{MAX_NUMNODES, NodeId};
use kernel_memory_addresses::Pfn;

/// Spans one reservation call has marked so far, one per node touched.
///
/// A range reserved across several nodes is undone from this log when a later
/// node reports a conflict.
pub(crate) struct ReserveLog {
    spans: [(NodeId, Pfn, Pfn); MAX_NUMNODES],
    len: usize,
}

impl ReserveLog {
    pub(crate) const fn new() -> Self {
        Self {
            spans: [(0, Pfn::new(0), Pfn::new(0)); MAX_NUMNODES],
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, nid: NodeId, start: Pfn, end: Pfn) {
        self.spans[self.len] = (nid, start, end);
        self.len += 1;
    }

    /// Spans in the reverse order they were taken.
    pub(crate) fn undo(&self) -> impl Iterator<Item = (NodeId, Pfn, Pfn)> + '_ {
        self.spans[..self.len].iter().rev().copied()
    }
}
