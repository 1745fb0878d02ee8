// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page-ownership and invalidation protocol keeping a partitioned guest's
//! memory coherent across monitor processes.
//!
//! Every node can read or write any guest physical page, but the nodes have
//! no shared physical memory; each keeps local copies coherent through a
//! manager-based, invalidation-based protocol. The manager for page `p` is
//! `p % N`, a pure function, so no ownership directory ever has to move.
//!
//! The execution engine consumes exactly two things from this crate: the
//! fault entry point [`CoherenceManager::on_access_fault`], called when a
//! local access trap might be a coherence miss, and the
//! [`GuestPageAccess::apply_protection_change`] callback, invoked after
//! every descriptor mutation so the engine can re-derive what the guest may
//! touch locally. The descriptor state is the sole authority for the access
//! the engine may permit without consulting the network.

#![forbid(unsafe_code)]

pub mod descriptor;
mod protocol;
pub mod save_restore;

pub use descriptor::CopySet;
pub use descriptor::PageDescriptor;
pub use descriptor::PageState;
pub use nodemesh::AccessKind;
pub use nodemesh::PAGE_SIZE;

use descriptor::PageTable;
use nodemesh::NodeComm;
use node_topology::NodeId;
use node_topology::NodeTopology;
use std::sync::Arc;

/// The execution engine's side of the coherence boundary.
///
/// Implementations hold the actual guest page contents (typically a mapping
/// shared with the traced guest process) and its protection bits.
pub trait GuestPageAccess: Send + Sync {
    /// Copies the current contents of `page_no` into `data`.
    fn read_page(&self, page_no: u32, data: &mut [u8; PAGE_SIZE]);

    /// Replaces the contents of `page_no` with `data`.
    fn write_page(&self, page_no: u32, data: &[u8; PAGE_SIZE]);

    /// Called after any descriptor mutation for `page_no`. The engine
    /// re-derives local read/write permission from `state` so future guest
    /// accesses trap (or stop trapping) correctly.
    fn apply_protection_change(&self, page_no: u32, state: PageState);
}

/// The coherence engine for one node: the page descriptor table and the
/// manager/owner/requester state machine that mutates it.
///
/// All mutation happens on the thread that calls [`Self::on_access_fault`]
/// and [`Self::service`] (the monitor's main thread); the transport's
/// receiver only ever appends to the message queue.
pub struct CoherenceManager {
    local_id: NodeId,
    topology: Arc<NodeTopology>,
    comm: Arc<NodeComm>,
    memory: Arc<dyn GuestPageAccess>,
    table: PageTable,
}

impl CoherenceManager {
    pub fn new(comm: Arc<NodeComm>, memory: Arc<dyn GuestPageAccess>, page_count: u32) -> Self {
        let topology = comm.topology().clone();
        let table = PageTable::new(page_count, topology.bootstrap());
        Self {
            local_id: comm.local_id(),
            topology,
            comm,
            memory,
            table,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn page_count(&self) -> u32 {
        self.table.page_count()
    }

    /// A point-in-time copy of the descriptor for `page_no`.
    pub fn descriptor(&self, page_no: u32) -> PageDescriptor {
        self.table.page(page_no).clone()
    }

    /// Drains and handles every currently queued protocol message. The
    /// monitor calls this between guest exits so manager and owner duties
    /// make progress while no local fault is outstanding.
    pub fn service(&self) {
        while let Some(msg) = self.comm.queue().try_remove() {
            self.handle_message(msg);
        }
    }
}
