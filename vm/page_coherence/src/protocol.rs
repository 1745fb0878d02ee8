// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The manager/owner/requester state machine.
//!
//! A transaction is one fetch -> invalidate -> ack -> ack-ack cycle for a
//! single page. The manager serializes transactions per page: `requesting`
//! plus `seq` give at-most-one-in-flight-per-page, which is the only
//! ordering property the protocol relies on. Transactions on different
//! pages interleave freely.
//!
//! No handler holds a page lock across a send or a nested dispatch; every
//! mutation is computed under the lock and the resulting traffic issued
//! after it is released.

use crate::descriptor::CopySet;
use crate::descriptor::PageState;
use crate::descriptor::PendingFetch;
use crate::CoherenceManager;
use crate::PAGE_SIZE;
use nodemesh::AccessKind;
use nodemesh::Message;
use nodemesh::Payload;
use node_topology::NodeId;

impl CoherenceManager {
    /// Entry point from the execution engine: a local access to `page_no`
    /// trapped. Returns whether the trap was a coherence miss; if the
    /// descriptor already permits the access, the trap was a genuine guest
    /// fault and must be delivered to the guest instead.
    ///
    /// On a miss, blocks for the full fetch round trip. Unrelated protocol
    /// traffic arriving in the meantime is handled inline rather than
    /// stalling behind this fault: the wait predicate is "this page became
    /// accessible", not "the next message is mine".
    pub fn on_access_fault(&self, page_no: u32, access: AccessKind) -> bool {
        if self.table.page(page_no).permits(access) {
            return false;
        }
        tracing::debug!(page_no, ?access, "access fault starts coherence fetch");
        self.deliver(
            Message::fetch_request(page_no, access, self.local_id),
            self.topology.manager_of(page_no),
        );
        loop {
            // Re-check first: a transaction that never left this node (the
            // manager and owner were both local) is already complete.
            if self.table.page(page_no).permits(access) {
                break;
            }
            let msg = self.comm.queue().remove();
            self.handle_message(msg);
        }
        true
    }

    /// Dispatches one inbound protocol message. Transport-level kinds never
    /// reach this point, and a body that does not parse is a build mismatch
    /// between nodes, which is fatal.
    pub fn handle_message(&self, msg: Message) {
        let source = msg.source_id;
        let payload = match msg.payload() {
            Ok(payload) => payload,
            Err(err) => panic!("malformed {:?} from {source}: {err}", msg.kind),
        };
        match payload {
            Payload::FetchRequest {
                page_no,
                access,
                requester,
            } => self.handle_fetch_request(page_no, access, requester),
            Payload::InvalidateRequest {
                page_no,
                access,
                requester,
                seq,
            } => self.handle_invalidate_request(page_no, access, requester, seq),
            Payload::FetchAck {
                page_no,
                access,
                page_data,
                seq,
            } => self.handle_fetch_ack(page_no, access, Some(&page_data), seq, source),
            Payload::FetchAckAck {
                page_no,
                access,
                requester,
                seq,
            } => self.handle_fetch_ack_ack(page_no, access, requester, seq),
            Payload::Init { .. } | Payload::Shutdown => {
                panic!("transport message {:?} reached protocol dispatch", msg.kind)
            }
        }
    }

    /// Routes `msg` to `dest`: in-process dispatch when the destination is
    /// this node, the transport otherwise. Protocol logic never needs to
    /// know which.
    fn deliver(&self, mut msg: Message, dest: NodeId) {
        if dest == self.local_id {
            msg.source_id = self.local_id;
            self.handle_message(msg);
        } else {
            self.comm.send(&msg, dest);
        }
    }

    /// Manager: a requester faulted on a page this node manages.
    fn handle_fetch_request(&self, page_no: u32, access: AccessKind, requester: NodeId) {
        let (seq, targets) = {
            let mut desc = self.table.page(page_no);
            if desc.requesting {
                // Another transaction for this page is mid-flight; queue
                // the fetch and replay it when the ack-ack clears the flag.
                tracing::debug!(page_no, %requester, "transaction in flight, deferring fetch");
                desc.pending.push_back(PendingFetch { access, requester });
                return;
            }
            desc.seq += 1;
            desc.requesting = true;

            let targets: Vec<NodeId> = match access {
                // Only the owner can hold a copy worth invalidating for a
                // read upgrade.
                AccessKind::Read => vec![desc.owner],
                // Every existing copy must be revoked before exclusive
                // access is granted. Skip the redundant re-delivery to the
                // requester itself unless it is the manager or the current
                // owner, which have their own handling.
                AccessKind::Write => {
                    let mut copyset = desc.copyset;
                    if requester != self.local_id && requester != desc.owner {
                        copyset.remove(requester);
                    }
                    copyset.iter().collect()
                }
            };
            (desc.seq, targets)
        };

        tracing::debug!(page_no, ?access, %requester, seq, ?targets, "starting invalidation round");
        for target in targets {
            self.deliver(
                Message::invalidate_request(page_no, access, requester, seq),
                target,
            );
        }
    }

    /// Owner or copy-holder: revoke or downgrade the local copy, and supply
    /// the page contents if this node is the owner.
    fn handle_invalidate_request(
        &self,
        page_no: u32,
        access: AccessKind,
        requester: NodeId,
        seq: u64,
    ) {
        let (was_owner, new_state) = {
            let mut desc = self.table.page(page_no);
            let was_owner = desc.owner == self.local_id;
            match access {
                AccessKind::Read => {
                    desc.state = PageState::ReadOnlyShared;
                    desc.copyset.insert(requester);
                }
                AccessKind::Write => {
                    desc.state = PageState::Invalid;
                    desc.owner = requester;
                }
            }
            (was_owner, desc.state)
        };
        self.memory.apply_protection_change(page_no, new_state);

        if requester == self.local_id && was_owner {
            // Self-fetch: this node is fetching a page it already owns
            // through a race. The data is resident; complete locally.
            self.handle_fetch_ack(page_no, access, None, seq, self.local_id);
        } else if was_owner {
            // Reply directly to the requester, not through the manager. The
            // protection change above already stopped the local guest from
            // touching the page, so the copy read here is stable.
            let mut data = Box::new([0u8; PAGE_SIZE]);
            self.memory.read_page(page_no, &mut data);
            tracing::debug!(page_no, %requester, seq, "supplying page as owner");
            self.deliver(Message::fetch_ack(page_no, access, &data, seq), requester);
        }
        // A mere read-copy holder revoked by a write fetch sends nothing.
    }

    /// Requester: the owner's reply arrived (or was synthesized locally for
    /// a self-fetch, in which case `page_data` is `None`).
    fn handle_fetch_ack(
        &self,
        page_no: u32,
        access: AccessKind,
        page_data: Option<&[u8; PAGE_SIZE]>,
        seq: u64,
        responder: NodeId,
    ) {
        if let Some(data) = page_data {
            self.memory.write_page(page_no, data);
        }
        let new_state = {
            let mut desc = self.table.page(page_no);
            match access {
                AccessKind::Read => {
                    desc.state = PageState::ReadOnlyShared;
                    desc.owner = responder;
                }
                AccessKind::Write => {
                    desc.state = PageState::ExclusivelyShared;
                    desc.owner = self.local_id;
                    desc.copyset = CopySet::single(self.local_id);
                }
            }
            desc.state
        };
        self.memory.apply_protection_change(page_no, new_state);
        tracing::debug!(page_no, ?access, %responder, seq, "fetch satisfied");
        self.deliver(
            Message::fetch_ack_ack(page_no, access, self.local_id, seq),
            self.topology.manager_of(page_no),
        );
    }

    /// Manager: the requester finished; commit the new owner and copyset
    /// and let the next deferred fetch (if any) run.
    fn handle_fetch_ack_ack(&self, page_no: u32, access: AccessKind, requester: NodeId, seq: u64) {
        let next = {
            let mut desc = self.table.page(page_no);
            assert_eq!(
                seq, desc.seq,
                "stale acknowledgment for page {page_no} from {requester}"
            );
            match access {
                AccessKind::Read => {
                    desc.copyset.insert(requester);
                }
                AccessKind::Write => {
                    // Every other copy was revoked by the invalidation
                    // round, so the copyset collapses to the new owner.
                    desc.owner = requester;
                    desc.copyset = CopySet::single(requester);
                }
            }
            desc.requesting = false;
            desc.pending.pop_front()
        };
        tracing::debug!(page_no, ?access, %requester, seq, "transaction committed");

        if let Some(deferred) = next {
            tracing::debug!(page_no, requester = %deferred.requester, "replaying deferred fetch");
            self.handle_fetch_request(page_no, deferred.access, deferred.requester);
        }
    }
}
