// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reliable, framed, multi-peer messaging between the monitor processes of a
//! partitioned VM.
//!
//! Three layers: the bit-exact wire format ([`protocol`]), the in-memory
//! message representation ([`message`]), and the mesh transport itself
//! ([`comm`]) with its arrival-ordered [`queue`]. The transport guarantees
//! per-connection FIFO delivery and nothing across connections; everything
//! stronger is the coherence protocol's job.

// UNSAFETY: The receiver thread multiplexes sockets with poll(2).
#![expect(unsafe_code)]

pub mod comm;
pub mod message;
pub mod protocol;
pub mod queue;

pub use comm::CommError;
pub use comm::NodeComm;
pub use message::AccessKind;
pub use message::Message;
pub use message::Payload;
pub use message::WireError;
pub use protocol::MessageKind;
pub use protocol::PAGE_SIZE;
pub use queue::MessageQueue;
