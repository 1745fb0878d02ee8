// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory representation of a wire message, with a constructor per kind
//! and a typed view of the body.

use crate::protocol;
use crate::protocol::MessageKind;
use crate::protocol::PAGE_SIZE;
use node_topology::NodeId;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Whether a fault (and the coherence traffic it starts) is for read or
/// write access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            AccessKind::Read => protocol::ACCESS_READ,
            AccessKind::Write => protocol::ACCESS_WRITE,
        }
    }

    fn from_wire(raw: u32) -> Result<Self, WireError> {
        match raw {
            protocol::ACCESS_READ => Ok(AccessKind::Read),
            protocol::ACCESS_WRITE => Ok(AccessKind::Write),
            _ => Err(WireError::BadAccessKind(raw)),
        }
    }
}

/// An error interpreting a message body.
///
/// These are never expected between nodes of the same build; callers treat
/// them as fatal.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown message kind {0:#x}")]
    UnknownKind(u32),
    #[error("{kind:?} body is {got} bytes, expected {expected}")]
    BadBodyLen {
        kind: MessageKind,
        expected: usize,
        got: usize,
    },
    #[error("bad access kind {0:#x}")]
    BadAccessKind(u32),
}

/// One typed unit of data exchanged between nodes.
///
/// `source_id` is stamped by the receiving transport from the connection the
/// message arrived on, never trusted from the wire. `message_id` is a
/// per-sender monotonic counter used only for diagnostics and ordering
/// visibility.
#[derive(Clone, Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub source_id: NodeId,
    pub message_id: i64,
    pub body: Vec<u8>,
}

impl Message {
    fn new(kind: MessageKind, body: Vec<u8>) -> Self {
        Self {
            kind,
            source_id: NodeId(0),
            message_id: 0,
            body,
        }
    }

    pub fn fetch_request(page_no: u32, access: AccessKind, requester: NodeId) -> Self {
        let body = protocol::FetchRequest {
            page_no: (page_no as i32).into(),
            access: access.to_wire().into(),
            requester_id: (requester.0 as i32).into(),
        };
        Self::new(MessageKind::FETCH_REQUEST, body.as_bytes().to_vec())
    }

    pub fn invalidate_request(page_no: u32, access: AccessKind, requester: NodeId, seq: u64) -> Self {
        let body = protocol::InvalidateRequest {
            page_no: (page_no as i32).into(),
            access: access.to_wire().into(),
            requester_id: (requester.0 as i32).into(),
            seq: (seq as i64).into(),
        };
        Self::new(MessageKind::INVALIDATE_REQUEST, body.as_bytes().to_vec())
    }

    pub fn fetch_ack(page_no: u32, access: AccessKind, page_data: &[u8; PAGE_SIZE], seq: u64) -> Self {
        let body = protocol::FetchAck {
            page_no: (page_no as i32).into(),
            access: access.to_wire().into(),
            page_data: *page_data,
            seq: (seq as i64).into(),
        };
        Self::new(MessageKind::FETCH_ACK, body.as_bytes().to_vec())
    }

    pub fn fetch_ack_ack(page_no: u32, access: AccessKind, requester: NodeId, seq: u64) -> Self {
        let body = protocol::FetchAckAck {
            page_no: (page_no as i32).into(),
            access: access.to_wire().into(),
            requester_id: (requester.0 as i32).into(),
            seq: (seq as i64).into(),
        };
        Self::new(MessageKind::FETCH_ACK_ACK, body.as_bytes().to_vec())
    }

    pub fn init(node_id: NodeId) -> Self {
        let body = protocol::Init {
            node_id: (node_id.0 as i32).into(),
        };
        Self::new(MessageKind::INIT, body.as_bytes().to_vec())
    }

    pub fn shutdown() -> Self {
        Self::new(MessageKind::SHUTDOWN, Vec::new())
    }

    /// Parses the body into its typed form.
    fn view<T>(&self) -> Result<&T, WireError>
    where
        T: FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        T::ref_from_bytes(&self.body).map_err(|_| WireError::BadBodyLen {
            kind: self.kind,
            expected: size_of::<T>(),
            got: self.body.len(),
        })
    }

    /// Returns the typed payload, parsing the body according to `kind`.
    pub fn payload(&self) -> Result<Payload, WireError> {
        let payload = match self.kind {
            MessageKind::FETCH_REQUEST => {
                let body: &protocol::FetchRequest = self.view()?;
                Payload::FetchRequest {
                    page_no: body.page_no.get() as u32,
                    access: AccessKind::from_wire(body.access.get())?,
                    requester: NodeId(body.requester_id.get() as u32),
                }
            }
            MessageKind::INVALIDATE_REQUEST => {
                let body: &protocol::InvalidateRequest = self.view()?;
                Payload::InvalidateRequest {
                    page_no: body.page_no.get() as u32,
                    access: AccessKind::from_wire(body.access.get())?,
                    requester: NodeId(body.requester_id.get() as u32),
                    seq: body.seq.get() as u64,
                }
            }
            MessageKind::FETCH_ACK => {
                let body: &protocol::FetchAck = self.view()?;
                Payload::FetchAck {
                    page_no: body.page_no.get() as u32,
                    access: AccessKind::from_wire(body.access.get())?,
                    page_data: Box::new(body.page_data),
                    seq: body.seq.get() as u64,
                }
            }
            MessageKind::FETCH_ACK_ACK => {
                let body: &protocol::FetchAckAck = self.view()?;
                Payload::FetchAckAck {
                    page_no: body.page_no.get() as u32,
                    access: AccessKind::from_wire(body.access.get())?,
                    requester: NodeId(body.requester_id.get() as u32),
                    seq: body.seq.get() as u64,
                }
            }
            MessageKind::INIT => {
                let body: &protocol::Init = self.view()?;
                Payload::Init {
                    node_id: NodeId(body.node_id.get() as u32),
                }
            }
            MessageKind::SHUTDOWN => {
                if !self.body.is_empty() {
                    return Err(WireError::BadBodyLen {
                        kind: self.kind,
                        expected: 0,
                        got: self.body.len(),
                    });
                }
                Payload::Shutdown
            }
            MessageKind(other) => return Err(WireError::UnknownKind(other)),
        };
        Ok(payload)
    }
}

/// The typed body of a [`Message`], one variant per kind, so message
/// dispatch is an exhaustive `match` rather than a table lookup.
pub enum Payload {
    FetchRequest {
        page_no: u32,
        access: AccessKind,
        requester: NodeId,
    },
    InvalidateRequest {
        page_no: u32,
        access: AccessKind,
        requester: NodeId,
        seq: u64,
    },
    FetchAck {
        page_no: u32,
        access: AccessKind,
        page_data: Box<[u8; PAGE_SIZE]>,
        seq: u64,
    },
    FetchAckAck {
        page_no: u32,
        access: AccessKind,
        requester: NodeId,
        seq: u64,
    },
    Init {
        node_id: NodeId,
    },
    Shutdown,
}
