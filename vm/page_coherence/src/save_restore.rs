// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Saved-state support for migration and resume.
//!
//! The saved state is decoupled from the runtime types: a flat,
//! little-endian, fixed-field-order record set covering every page
//! descriptor `(state, copyset, owner, seq, requesting)` plus any messages
//! still queued but unconsumed at save time. A restored node rebuilds
//! identical coherence state and replays the queued messages through the
//! normal dispatch path; fetches the manager had deferred are re-expressed
//! as queued `FETCH_REQUEST`s so they replay the same way.
//!
//! File I/O is the surrounding snapshot machinery's problem; this module
//! only defines the bit-exact pack/unpack of the coherence core's share.

use crate::descriptor::CopySet;
use crate::descriptor::PageState;
use crate::CoherenceManager;
use nodemesh::Message;
use nodemesh::MessageKind;
use node_topology::NodeId;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::little_endian::I32;
use zerocopy::little_endian::I64;
use zerocopy::little_endian::U32;
use zerocopy::little_endian::U64;

/// Implemented by objects whose state survives a migration.
pub trait SaveRestore {
    /// The concrete saved state type, decoupled from the runtime type so
    /// the persisted layout cannot drift by accident.
    type SavedState;

    /// Saves the object's state.
    fn save(&self) -> Self::SavedState;
    /// Restores the object's state.
    fn restore(&mut self, state: Self::SavedState) -> Result<(), RestoreError>;
}

/// An error rebuilding state from a snapshot.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("not a coherence snapshot")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot truncated")]
    Truncated,
    #[error("{0} trailing bytes after snapshot")]
    TrailingBytes(usize),
    #[error("snapshot describes {got} pages, this node has {expected}")]
    WrongPageCount { expected: u32, got: u32 },
    #[error("bad page state {0:#x} in snapshot")]
    BadState(u32),
}

/// One saved page descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct SavedPageDescriptor {
    pub state: PageState,
    pub copyset: u64,
    pub owner: NodeId,
    pub seq: u64,
    pub requesting: bool,
}

/// One saved queued-but-unconsumed message.
#[derive(Clone, Debug, PartialEq)]
pub struct SavedMessage {
    pub kind: u32,
    pub source_id: u32,
    pub message_id: i64,
    pub body: Vec<u8>,
}

/// The coherence core's entire persisted surface.
#[derive(Clone, Debug, PartialEq)]
pub struct CoherenceSavedState {
    pub descriptors: Vec<SavedPageDescriptor>,
    pub queued: Vec<SavedMessage>,
}

const MAGIC: [u8; 4] = *b"PGCO";
const VERSION: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct SnapshotHeader {
    magic: [u8; 4],
    version: U32,
    pages: U32,
    queued: U32,
}

#[repr(C)]
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct PageRecord {
    state: U32,
    copyset: U64,
    owner: I32,
    seq: I64,
    requesting: u8,
}

#[repr(C)]
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct QueuedRecord {
    kind: U32,
    body_len: U32,
    source_id: U32,
    message_id: I64,
}

fn state_to_raw(state: PageState) -> u32 {
    match state {
        PageState::Invalid => 0,
        PageState::ReadOnlyShared => 1,
        PageState::ExclusivelyShared => 2,
    }
}

fn state_from_raw(raw: u32) -> Result<PageState, RestoreError> {
    match raw {
        0 => Ok(PageState::Invalid),
        1 => Ok(PageState::ReadOnlyShared),
        2 => Ok(PageState::ExclusivelyShared),
        other => Err(RestoreError::BadState(other)),
    }
}

impl CoherenceSavedState {
    /// Serializes to the stable wire layout.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let header = SnapshotHeader {
            magic: MAGIC,
            version: VERSION.into(),
            pages: (self.descriptors.len() as u32).into(),
            queued: (self.queued.len() as u32).into(),
        };
        out.extend_from_slice(header.as_bytes());
        for desc in &self.descriptors {
            let record = PageRecord {
                state: state_to_raw(desc.state).into(),
                copyset: desc.copyset.into(),
                owner: (desc.owner.0 as i32).into(),
                seq: (desc.seq as i64).into(),
                requesting: desc.requesting as u8,
            };
            out.extend_from_slice(record.as_bytes());
        }
        for msg in &self.queued {
            let record = QueuedRecord {
                kind: msg.kind.into(),
                body_len: (msg.body.len() as u32).into(),
                source_id: msg.source_id.into(),
                message_id: msg.message_id.into(),
            };
            out.extend_from_slice(record.as_bytes());
            out.extend_from_slice(&msg.body);
        }
        out
    }

    /// Deserializes from the stable wire layout.
    pub fn unpack(data: &[u8]) -> Result<Self, RestoreError> {
        let (header, mut rest) =
            SnapshotHeader::ref_from_prefix(data).map_err(|_| RestoreError::Truncated)?;
        if header.magic != MAGIC {
            return Err(RestoreError::BadMagic);
        }
        if header.version.get() != VERSION {
            return Err(RestoreError::UnsupportedVersion(header.version.get()));
        }

        let mut descriptors = Vec::with_capacity(header.pages.get() as usize);
        for _ in 0..header.pages.get() {
            let (record, tail) =
                PageRecord::ref_from_prefix(rest).map_err(|_| RestoreError::Truncated)?;
            descriptors.push(SavedPageDescriptor {
                state: state_from_raw(record.state.get())?,
                copyset: record.copyset.get(),
                owner: NodeId(record.owner.get() as u32),
                seq: record.seq.get() as u64,
                requesting: record.requesting != 0,
            });
            rest = tail;
        }

        let mut queued = Vec::with_capacity(header.queued.get() as usize);
        for _ in 0..header.queued.get() {
            let (record, tail) =
                QueuedRecord::ref_from_prefix(rest).map_err(|_| RestoreError::Truncated)?;
            let body_len = record.body_len.get() as usize;
            if tail.len() < body_len {
                return Err(RestoreError::Truncated);
            }
            let (body, tail) = tail.split_at(body_len);
            queued.push(SavedMessage {
                kind: record.kind.get(),
                source_id: record.source_id.get(),
                message_id: record.message_id.get(),
                body: body.to_vec(),
            });
            rest = tail;
        }

        if !rest.is_empty() {
            return Err(RestoreError::TrailingBytes(rest.len()));
        }
        Ok(Self {
            descriptors,
            queued,
        })
    }
}

impl SaveRestore for CoherenceManager {
    type SavedState = CoherenceSavedState;

    fn save(&self) -> CoherenceSavedState {
        let mut descriptors = Vec::with_capacity(self.page_count() as usize);
        let mut queued = Vec::new();
        for page_no in 0..self.page_count() {
            let desc = self.descriptor(page_no);
            descriptors.push(SavedPageDescriptor {
                state: desc.state,
                copyset: desc.copyset.bits(),
                owner: desc.owner,
                seq: desc.seq,
                requesting: desc.requesting,
            });
            for pending in desc.pending {
                let msg = Message::fetch_request(page_no, pending.access, pending.requester);
                queued.push(SavedMessage {
                    kind: msg.kind.0,
                    source_id: pending.requester.0,
                    message_id: msg.message_id,
                    body: msg.body,
                });
            }
        }
        for msg in self.comm.queue().snapshot() {
            queued.push(SavedMessage {
                kind: msg.kind.0,
                source_id: msg.source_id.0,
                message_id: msg.message_id,
                body: msg.body,
            });
        }
        CoherenceSavedState {
            descriptors,
            queued,
        }
    }

    fn restore(&mut self, state: CoherenceSavedState) -> Result<(), RestoreError> {
        let expected = self.page_count();
        if state.descriptors.len() != expected as usize {
            return Err(RestoreError::WrongPageCount {
                expected,
                got: state.descriptors.len() as u32,
            });
        }
        for (page_no, saved) in state.descriptors.iter().enumerate() {
            let mut desc = self.table.page(page_no as u32);
            desc.state = saved.state;
            desc.copyset = CopySet::from_bits(saved.copyset);
            desc.owner = saved.owner;
            desc.seq = saved.seq;
            desc.requesting = saved.requesting;
            desc.pending.clear();
        }
        for msg in state.queued {
            self.comm.queue().add(Message {
                kind: MessageKind(msg.kind),
                source_id: NodeId(msg.source_id),
                message_id: msg.message_id,
                body: msg.body,
            });
        }
        Ok(())
    }
}
