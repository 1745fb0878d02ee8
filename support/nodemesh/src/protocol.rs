// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! On-wire message layout.
//!
//! Every message is a fixed header immediately followed by `body_len` raw
//! payload bytes. All integers are little endian; the layout is bit-exact
//! across nodes of the same build, with no compression and no checksum
//! beyond the transport's own reliability.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::little_endian::I32;
use zerocopy::little_endian::I64;
use zerocopy::little_endian::U32;

/// Size in bytes of one guest physical page, the granularity of all
/// coherence traffic.
pub const PAGE_SIZE: usize = 4096;

/// Size in bytes of the fixed wire header.
pub const HEADER_LEN: usize = size_of::<MessageHeader>();

/// Messages a node will never legitimately exceed; anything larger on the
/// wire is a build mismatch.
pub const MAX_BODY_LEN: usize = 0x1_0000;

/// Discriminates the payload schema of a message.
///
/// This stays an open value on the wire so that an unrecognized kind can be
/// reported (and treated as fatal) instead of being undefined behavior to
/// even look at.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MessageKind(pub u32);

impl MessageKind {
    /// Requester -> manager: fault on a page, asking for read or write
    /// access.
    pub const FETCH_REQUEST: Self = Self(1);
    /// Manager -> owner/copy-holders: revoke or downgrade a copy on behalf
    /// of a requester.
    pub const INVALIDATE_REQUEST: Self = Self(2);
    /// Owner -> requester: page contents plus the transaction sequence
    /// number.
    pub const FETCH_ACK: Self = Self(3);
    /// Requester -> manager: the fetch completed; commit the new owner and
    /// copyset.
    pub const FETCH_ACK_ACK: Self = Self(4);
    /// Transport handshake carrying the connecting node's id.
    pub const INIT: Self = Self(5);
    /// Transport teardown announcement preceding a migration.
    pub const SHUTDOWN: Self = Self(6);
}

impl std::fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::FETCH_REQUEST => "FETCH_REQUEST",
            Self::INVALIDATE_REQUEST => "INVALIDATE_REQUEST",
            Self::FETCH_ACK => "FETCH_ACK",
            Self::FETCH_ACK_ACK => "FETCH_ACK_ACK",
            Self::INIT => "INIT",
            Self::SHUTDOWN => "SHUTDOWN",
            _ => return write!(f, "MessageKind({})", self.0),
        };
        f.pad(name)
    }
}

/// The fixed wire header.
///
/// `reserved_source_id` is not trusted from the wire; the receiver stamps
/// the source from the connection the message arrived on.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub body_len: U32,
    pub reserved_source_id: U32,
    pub message_id: I64,
}

/// Body of [`MessageKind::FETCH_REQUEST`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FetchRequest {
    pub page_no: I32,
    pub access: U32,
    pub requester_id: I32,
}

/// Body of [`MessageKind::INVALIDATE_REQUEST`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InvalidateRequest {
    pub page_no: I32,
    pub access: U32,
    pub requester_id: I32,
    pub seq: I64,
}

/// Body of [`MessageKind::FETCH_ACK`], carrying the full page contents.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FetchAck {
    pub page_no: I32,
    pub access: U32,
    pub page_data: [u8; PAGE_SIZE],
    pub seq: I64,
}

/// Body of [`MessageKind::FETCH_ACK_ACK`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FetchAckAck {
    pub page_no: I32,
    pub access: U32,
    pub requester_id: I32,
    pub seq: I64,
}

/// Body of [`MessageKind::INIT`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Init {
    pub node_id: I32,
}

/// Access level named by fetch and invalidate traffic.
pub const ACCESS_READ: u32 = 0;
/// See [`ACCESS_READ`].
pub const ACCESS_WRITE: u32 = 1;
