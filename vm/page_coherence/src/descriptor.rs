// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-page coherence metadata.
//!
//! Every node holds a full table describing every guest physical page, not
//! just the pages it currently has a copy of. A node's descriptor for a
//! page is authoritative for its own local access rights; the manager's
//! descriptor for a page is additionally authoritative for the owner and
//! copyset it serializes transactions against.

use nodemesh::AccessKind;
use node_topology::NodeId;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::fmt;

/// Local validity of a page's copy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageState {
    /// No valid local copy; any access must fetch.
    Invalid,
    /// Valid for reading; a write must upgrade through the manager.
    ReadOnlyShared,
    /// The sole valid copy anywhere; reads and writes are free.
    ExclusivelyShared,
}

impl PageState {
    /// Whether this state permits `access` without any protocol traffic.
    pub fn permits(self, access: AccessKind) -> bool {
        match self {
            PageState::Invalid => false,
            PageState::ReadOnlyShared => access == AccessKind::Read,
            PageState::ExclusivelyShared => true,
        }
    }
}

/// The set of nodes holding a currently valid copy of a page, as a bitmask
/// over node ids.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct CopySet(u64);

impl CopySet {
    pub const EMPTY: Self = Self(0);

    pub fn single(id: NodeId) -> Self {
        Self(1 << id.0)
    }

    pub fn insert(&mut self, id: NodeId) {
        self.0 |= 1 << id.0;
    }

    pub fn remove(&mut self, id: NodeId) {
        self.0 &= !(1 << id.0);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let id = bits.trailing_zeros();
            bits &= bits - 1;
            Some(NodeId(id))
        })
    }

    /// The raw bitmask, for the snapshot format.
    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for CopySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A fetch the manager could not start because another transaction for the
/// same page was in flight; replayed in FIFO order when it completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingFetch {
    pub access: AccessKind,
    pub requester: NodeId,
}

/// Coherence metadata for one guest physical page.
#[derive(Clone, Debug, PartialEq)]
pub struct PageDescriptor {
    pub state: PageState,
    /// For `ExclusivelyShared`, the sole valid copy holder; otherwise the
    /// node last known to have supplied the data, which is where a future
    /// write's invalidation is aimed.
    pub owner: NodeId,
    pub copyset: CopySet,
    /// Bumped by the manager for each accepted transaction; correlates an
    /// invalidation round with its eventual acknowledgment.
    pub seq: u64,
    /// True while a transaction for this page is in flight at the manager.
    pub requesting: bool,
    pub(crate) pending: VecDeque<PendingFetch>,
}

impl PageDescriptor {
    /// The launch-time descriptor: no page has been faulted anywhere, so the
    /// bootstrap node nominally owns (and nominally holds) everything.
    fn initial(state: PageState, owner: NodeId) -> Self {
        Self {
            state,
            owner,
            copyset: CopySet::single(owner),
            seq: 0,
            requesting: false,
            pending: VecDeque::new(),
        }
    }

    pub fn permits(&self, access: AccessKind) -> bool {
        self.state.permits(access)
    }

    /// Number of deferred fetches waiting on the in-flight transaction.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// The full table, one lock per page so transactions on different pages
/// never contend.
pub struct PageTable {
    pages: Vec<Mutex<PageDescriptor>>,
}

impl PageTable {
    pub fn new(page_count: u32, bootstrap: NodeId) -> Self {
        let pages = (0..page_count)
            .map(|page_no| {
                let state = if page_no == 0 {
                    PageState::ExclusivelyShared
                } else {
                    PageState::Invalid
                };
                Mutex::new(PageDescriptor::initial(state, bootstrap))
            })
            .collect();
        Self { pages }
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Locks the descriptor for `page_no`. A page number outside the table
    /// can only come from a corrupt or mismatched peer, which is fatal.
    pub(crate) fn page(&self, page_no: u32) -> MutexGuard<'_, PageDescriptor> {
        match self.pages.get(page_no as usize) {
            Some(page) => page.lock(),
            None => panic!("page {page_no} out of range ({} pages)", self.pages.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CopySet;
    use super::PageState;
    use super::PageTable;
    use nodemesh::AccessKind;
    use node_topology::NodeId;

    #[test]
    fn copyset_ops() {
        let mut set = CopySet::single(NodeId(3));
        set.insert(NodeId(0));
        set.insert(NodeId(63));
        assert_eq!(set.count(), 3);
        assert!(set.contains(NodeId(3)));
        set.remove(NodeId(3));
        assert!(!set.contains(NodeId(3)));
        let ids: Vec<_> = set.iter().collect();
        assert_eq!(ids, [NodeId(0), NodeId(63)]);
        assert_eq!(CopySet::from_bits(set.bits()), set);
    }

    #[test]
    fn state_permissions() {
        assert!(!PageState::Invalid.permits(AccessKind::Read));
        assert!(PageState::ReadOnlyShared.permits(AccessKind::Read));
        assert!(!PageState::ReadOnlyShared.permits(AccessKind::Write));
        assert!(PageState::ExclusivelyShared.permits(AccessKind::Write));
    }

    #[test]
    fn initial_table_layout() {
        let table = PageTable::new(4, NodeId(2));
        let page0 = table.page(0);
        assert_eq!(page0.state, PageState::ExclusivelyShared);
        assert_eq!(page0.owner, NodeId(2));
        assert_eq!(page0.copyset, CopySet::single(NodeId(2)));
        drop(page0);
        let page3 = table.page(3);
        assert_eq!(page3.state, PageState::Invalid);
        assert_eq!(page3.owner, NodeId(2));
        assert_eq!(page3.copyset, CopySet::single(NodeId(2)));
        assert_eq!(page3.seq, 0);
        assert!(!page3.requesting);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_page_is_fatal() {
        let table = PageTable::new(4, NodeId(0));
        let _ = table.page(4);
    }
}
