// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TCP mesh transport.
//!
//! Each pair of nodes communicates over a single persistent TCP connection.
//! At launch, nodes with a lower id actively connect to all higher-id nodes
//! and higher-id nodes accept from all lower-id nodes; a resuming node
//! (post-migration) instead actively reconnects to every peer, since the new
//! process has no accepted connections to inherit. Every connect or accept
//! is followed by an `INIT` handshake carrying the connecting node's id so
//! the accepting side can bind the stream to the right connection slot.
//!
//! A dedicated receiver thread multiplexes all connections with `poll(2)`,
//! incrementally reassembling one header and one body per connection, and
//! feeds completed messages into the [`MessageQueue`]. `INIT` and `SHUTDOWN`
//! are consumed by the transport itself and never reach protocol handlers.

#![cfg(unix)]

use crate::message::Message;
use crate::protocol::HEADER_LEN;
use crate::protocol::MAX_BODY_LEN;
use crate::protocol::MessageHeader;
use crate::protocol::MessageKind;
use crate::queue::MessageQueue;
use node_topology::NodeId;
use node_topology::NodeTopology;
use parking_lot::Condvar;
use parking_lot::Mutex;
use socket2::Domain;
use socket2::Socket;
use socket2::Type;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::os::unix::net::UnixStream;
use std::os::unix::prelude::*;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// How long to keep retrying an active connect while the peer process is
/// still launching.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_RETRY_LIMIT: u32 = 200;

/// An error establishing the mesh. Once the mesh is up, transport failures
/// are no longer recoverable and do not use this type.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("failed to resolve {addr}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {peer} at {addr}")]
    Connect {
        peer: NodeId,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept a peer connection")]
    Accept(#[source] io::Error),
    #[error("handshake failed")]
    Handshake(#[source] io::Error),
    #[error("expected INIT during handshake, got {0:?}")]
    UnexpectedHandshake(MessageKind),
    #[error("handshake names unknown or duplicate peer {0}")]
    BadHandshakePeer(NodeId),
}

/// Per-peer connection slot, shared between senders and the receiver
/// thread. `sending` serializes a close against an in-flight send; `closing`
/// marks that an end-of-stream from this peer is part of the SHUTDOWN
/// rendezvous rather than a failure.
#[derive(Default)]
struct SlotState {
    writer: Option<TcpStream>,
    sending: bool,
    closing: bool,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

struct Shared {
    local_id: NodeId,
    topology: Arc<NodeTopology>,
    queue: MessageQueue,
    slots: Vec<Slot>,
    next_message_id: AtomicI64,
    stop: AtomicBool,
    wake_tx: Mutex<UnixStream>,
    wakeup: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// The messaging transport: one connection to every other node, a
/// background receiver, and a thread-safe send path.
pub struct NodeComm {
    shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
}

impl NodeComm {
    /// Establishes the full mesh and starts the receiver thread. Blocks
    /// until every peer connection is active.
    pub fn new(
        local_id: NodeId,
        topology: Arc<NodeTopology>,
        resuming: bool,
    ) -> Result<Self, CommError> {
        assert!(topology.contains(local_id));
        let n = topology.node_count();

        let listener = bind_listener(&topology, local_id)?;
        let (wake_tx, wake_rx) = UnixStream::pair().map_err(CommError::Handshake)?;

        let shared = Arc::new(Shared {
            local_id,
            topology: topology.clone(),
            queue: MessageQueue::new(),
            slots: (0..n).map(|_| Slot::default()).collect(),
            next_message_id: AtomicI64::new(1),
            stop: AtomicBool::new(false),
            wake_tx: Mutex::new(wake_tx),
            wakeup: Mutex::new(None),
        });

        let mut readers: Vec<Option<Conn>> = (0..n).map(|_| None).collect();

        // Active side: dial higher-id peers, or everyone when resuming.
        for peer in topology.peers_of(local_id) {
            if !resuming && peer < local_id {
                continue;
            }
            let stream = connect_peer(&shared, peer)?;
            let writer = stream.try_clone().map_err(CommError::Handshake)?;
            shared.slots[peer.index()].state.lock().writer = Some(writer);
            readers[peer.index()] = Some(Conn::new(stream));
            tracing::debug!(%peer, "connection established (active)");
        }

        // Passive side: accept one connection per lower-id peer and bind it
        // by its INIT handshake.
        if !resuming {
            for _ in 0..local_id.index() {
                let (stream, addr) = listener.accept().map_err(CommError::Accept)?;
                let _ = stream.set_nodelay(true);
                let (header, body) = read_message_blocking(&stream).map_err(CommError::Handshake)?;
                let peer = parse_init(&header, body)?;
                if !topology.contains(peer)
                    || peer >= local_id
                    || readers[peer.index()].is_some()
                {
                    return Err(CommError::BadHandshakePeer(peer));
                }
                let writer = stream.try_clone().map_err(CommError::Handshake)?;
                shared.slots[peer.index()].state.lock().writer = Some(writer);
                readers[peer.index()] = Some(Conn::new(stream));
                tracing::debug!(%peer, %addr, "connection established (passive)");
            }
        }

        listener
            .set_nonblocking(true)
            .map_err(CommError::Accept)?;

        let receiver = Receiver {
            shared: shared.clone(),
            listener,
            wake_rx,
            readers,
            pending: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name(format!("nodemesh-recv-{local_id}"))
            .spawn(move || receiver.run())
            .map_err(CommError::Handshake)?;

        tracing::info!(%local_id, nodes = n, resuming, "mesh established");
        Ok(Self {
            shared,
            receiver: Some(thread),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.shared.local_id
    }

    pub fn topology(&self) -> &Arc<NodeTopology> {
        &self.shared.topology
    }

    /// The queue the receiver delivers inbound protocol messages to.
    pub fn queue(&self) -> &MessageQueue {
        &self.shared.queue
    }

    /// Registers a hook invoked after each inbound message is queued, used
    /// to interrupt a consumer that is blocked on something other than the
    /// queue (typically the traced guest).
    pub fn set_wakeup(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.wakeup.lock() = Some(Box::new(hook));
    }

    /// Sends `msg` to `dest`, blocking until that connection is active and
    /// serializing against concurrent sends and closes on the same
    /// connection. A write failure is fatal: the mesh does not tolerate
    /// partial connectivity.
    pub fn send(&self, msg: &Message, dest: NodeId) {
        self.shared.send(msg, dest)
    }

    /// Sends `msg` to every other node, sequentially.
    pub fn broadcast(&self, msg: &Message) {
        for peer in self.shared.topology.peers_of(self.shared.local_id) {
            self.shared.send(msg, peer);
        }
    }

    /// Pre-migration rendezvous: announce SHUTDOWN to every peer, then
    /// block until every connection has cycled back to inactive. Peers tear
    /// down their side on receipt and later re-accept a fresh connection
    /// from this node's new incarnation.
    pub fn shutdown(&self) {
        tracing::info!("announcing shutdown to all peers");
        for peer in self.shared.topology.peers_of(self.shared.local_id) {
            self.shared.slots[peer.index()].state.lock().closing = true;
        }
        self.broadcast(&Message::shutdown());
        for peer in self.shared.topology.peers_of(self.shared.local_id) {
            let slot = &self.shared.slots[peer.index()];
            let mut state = slot.state.lock();
            while state.writer.is_some() || state.sending {
                slot.cond.wait(&mut state);
            }
        }
        tracing::info!("all peer connections quiesced");
    }
}

impl Drop for NodeComm {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.shared.wake_tx.lock().write(&[0]);
        if let Some(thread) = self.receiver.take() {
            let _ = thread.join();
        }
    }
}

impl Shared {
    fn send(&self, msg: &Message, dest: NodeId) {
        assert_ne!(dest, self.local_id, "self-addressed sends use local dispatch");
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let header = MessageHeader {
            kind: msg.kind,
            body_len: (msg.body.len() as u32).into(),
            reserved_source_id: 0.into(),
            message_id: message_id.into(),
        };

        let slot = &self.slots[dest.index()];
        let mut stream = {
            let mut state = slot.state.lock();
            loop {
                if !state.sending {
                    if let Some(stream) = state.writer.take() {
                        state.sending = true;
                        break stream;
                    }
                }
                slot.cond.wait(&mut state);
            }
        };

        let result = write_message(&mut stream, &header, &msg.body);

        let mut state = slot.state.lock();
        state.writer = Some(stream);
        state.sending = false;
        slot.cond.notify_all();
        drop(state);

        if let Err(err) = result {
            panic!("send of {:?} to {dest} failed: {err}", msg.kind);
        }
        tracing::trace!(%dest, kind = ?msg.kind, message_id, "sent");
    }
}

fn resolve(addr: &node_topology::PeerAddress) -> Result<SocketAddr, CommError> {
    let mut addrs = (addr.host.as_str(), addr.port)
        .to_socket_addrs()
        .map_err(|source| CommError::Resolve {
            addr: addr.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| CommError::Resolve {
        addr: addr.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
    })
}

fn bind_listener(topology: &NodeTopology, local_id: NodeId) -> Result<TcpListener, CommError> {
    let addr = resolve(topology.addr(local_id))?;
    let map_err = |source| CommError::Bind {
        addr: addr.to_string(),
        source,
    };
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(map_err)?;
    // The previous incarnation of this node may have left the port in
    // TIME_WAIT; a resuming node must be able to rebind it immediately.
    socket.set_reuse_address(true).map_err(map_err)?;
    socket.bind(&addr.into()).map_err(map_err)?;
    socket.listen(128).map_err(map_err)?;
    Ok(socket.into())
}

fn connect_peer(shared: &Shared, peer: NodeId) -> Result<TcpStream, CommError> {
    let addr = resolve(shared.topology.addr(peer))?;
    let mut attempts = 0;
    let stream = loop {
        match TcpStream::connect(addr) {
            Ok(stream) => break stream,
            Err(err)
                if attempts < CONNECT_RETRY_LIMIT
                    && matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
            {
                attempts += 1;
                std::thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(source) => {
                return Err(CommError::Connect {
                    peer,
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    };
    let _ = stream.set_nodelay(true);

    // Identify ourselves so the peer can bind this stream to our slot.
    let init = Message::init(shared.local_id);
    let header = MessageHeader {
        kind: init.kind,
        body_len: (init.body.len() as u32).into(),
        reserved_source_id: 0.into(),
        message_id: shared
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .into(),
    };
    let mut writer = &stream;
    write_message(&mut writer, &header, &init.body).map_err(CommError::Handshake)?;
    Ok(stream)
}

fn write_message(stream: &mut impl Write, header: &MessageHeader, body: &[u8]) -> io::Result<()> {
    stream.write_all(header.as_bytes())?;
    if !body.is_empty() {
        stream.write_all(body)?;
    }
    Ok(())
}

fn read_message_blocking(mut stream: &TcpStream) -> io::Result<(MessageHeader, Vec<u8>)> {
    let mut header = MessageHeader::new_zeroed();
    stream.read_exact(header.as_mut_bytes())?;
    let len = header.body_len.get() as usize;
    if len > MAX_BODY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversized body ({len} bytes)"),
        ));
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body)?;
    Ok((header, body))
}

fn parse_init(header: &MessageHeader, body: Vec<u8>) -> Result<NodeId, CommError> {
    if header.kind != MessageKind::INIT {
        return Err(CommError::UnexpectedHandshake(header.kind));
    }
    let msg = Message {
        kind: header.kind,
        source_id: NodeId(0),
        message_id: header.message_id.get(),
        body,
    };
    match msg.payload() {
        Ok(crate::message::Payload::Init { node_id }) => Ok(node_id),
        _ => Err(CommError::UnexpectedHandshake(header.kind)),
    }
}

/// Receive-reassembly state of one connection: between messages
/// (accumulating a header) or mid-message (accumulating a body).
enum RecvPhase {
    Header { header: MessageHeader, got: usize },
    Body { header: MessageHeader, body: Vec<u8>, got: usize },
}

impl RecvPhase {
    fn idle() -> Self {
        RecvPhase::Header {
            header: MessageHeader::new_zeroed(),
            got: 0,
        }
    }
}

struct Conn {
    stream: TcpStream,
    phase: RecvPhase,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            phase: RecvPhase::idle(),
        }
    }
}

enum Step {
    Complete(MessageHeader, Vec<u8>),
    Partial,
    Eof,
}

/// Advances a connection's reassembly by a single `read`. Only called after
/// `poll` reported the stream readable, so the read does not block.
fn read_step(conn: &mut Conn) -> io::Result<Step> {
    match &mut conn.phase {
        RecvPhase::Header { header, got } => {
            let n = conn.stream.read(&mut header.as_mut_bytes()[*got..])?;
            if n == 0 {
                return Ok(Step::Eof);
            }
            *got += n;
            if *got == HEADER_LEN {
                let header = *header;
                let len = header.body_len.get() as usize;
                if len > MAX_BODY_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("oversized body ({len} bytes) for {:?}", header.kind),
                    ));
                }
                if len == 0 {
                    conn.phase = RecvPhase::idle();
                    return Ok(Step::Complete(header, Vec::new()));
                }
                conn.phase = RecvPhase::Body {
                    header,
                    body: vec![0; len],
                    got: 0,
                };
            }
            Ok(Step::Partial)
        }
        RecvPhase::Body { header, body, got } => {
            let n = conn.stream.read(&mut body[*got..])?;
            if n == 0 {
                return Ok(Step::Eof);
            }
            *got += n;
            if *got == body.len() {
                let header = *header;
                let body = std::mem::take(body);
                conn.phase = RecvPhase::idle();
                return Ok(Step::Complete(header, body));
            }
            Ok(Step::Partial)
        }
    }
}

enum Target {
    Wake,
    Listener,
    Pending(usize),
    Peer(NodeId),
}

struct Receiver {
    shared: Arc<Shared>,
    listener: TcpListener,
    wake_rx: UnixStream,
    readers: Vec<Option<Conn>>,
    pending: Vec<Conn>,
}

impl Receiver {
    fn run(mut self) {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut targets: Vec<Target> = Vec::new();

        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }

            fds.clear();
            targets.clear();
            let mut watch = |fd: RawFd, target: Target| {
                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
                targets.push(target);
            };
            watch(self.wake_rx.as_raw_fd(), Target::Wake);
            watch(self.listener.as_raw_fd(), Target::Listener);
            for (i, conn) in self.pending.iter().enumerate() {
                watch(conn.stream.as_raw_fd(), Target::Pending(i));
            }
            for (i, conn) in self.readers.iter().enumerate() {
                if let Some(conn) = conn {
                    watch(conn.stream.as_raw_fd(), Target::Peer(NodeId(i as u32)));
                }
            }

            if let Err(err) = poll(&mut fds) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "poll failed; aborting"
                );
                std::process::abort();
            }

            let mut pending_ready = Vec::new();
            for (pollfd, target) in fds.iter().zip(&targets) {
                if pollfd.revents == 0 {
                    continue;
                }
                match target {
                    Target::Wake => {
                        let mut buf = [0u8; 8];
                        let _ = (&self.wake_rx).read(&mut buf);
                    }
                    Target::Listener => self.accept_ready(),
                    Target::Pending(i) => pending_ready.push(*i),
                    Target::Peer(id) => self.service_peer(*id),
                }
            }
            // Highest index first so swap_remove keeps the rest valid.
            pending_ready.sort_unstable_by(|a, b| b.cmp(a));
            for i in pending_ready {
                self.service_pending(i);
            }
        }
    }

    /// Accepts whatever connections are ready; each sits in `pending` until
    /// its INIT handshake names the peer it belongs to.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(%addr, "accepted connection, awaiting INIT");
                    self.pending.push(Conn::new(stream));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "accept failed"
                    );
                    break;
                }
            }
        }
    }

    fn service_pending(&mut self, i: usize) {
        match read_step(&mut self.pending[i]) {
            Ok(Step::Complete(header, body)) => {
                let conn = self.pending.swap_remove(i);
                self.bind_pending(conn, header, body);
            }
            Ok(Step::Partial) => {}
            Ok(Step::Eof) => {
                tracing::warn!("connection closed before INIT");
                self.pending.swap_remove(i);
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "handshake read failed"
                );
                self.pending.swap_remove(i);
            }
        }
    }

    fn bind_pending(&mut self, mut conn: Conn, header: MessageHeader, body: Vec<u8>) {
        let peer = match parse_init(&header, body) {
            Ok(peer) => peer,
            Err(err) => fatal(self.shared.local_id, format_args!("bad handshake: {err}")),
        };
        if !self.shared.topology.contains(peer) || peer == self.shared.local_id {
            fatal(
                self.shared.local_id,
                format_args!("handshake from unknown peer {peer}"),
            );
        }
        if self.readers[peer.index()].is_some() {
            // The peer reconnected without a SHUTDOWN in between; the old
            // stream is dead from its perspective.
            tracing::warn!(%peer, "replacing existing connection");
            self.teardown(peer, true);
        }
        let writer = match conn.stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => fatal(self.shared.local_id, format_args!("clone failed: {err}")),
        };
        conn.phase = RecvPhase::idle();
        let slot = &self.shared.slots[peer.index()];
        {
            let mut state = slot.state.lock();
            state.writer = Some(writer);
            state.closing = false;
        }
        slot.cond.notify_all();
        self.readers[peer.index()] = Some(conn);
        tracing::debug!(%peer, "connection established (reaccepted)");
    }

    fn service_peer(&mut self, peer: NodeId) {
        let Some(conn) = &mut self.readers[peer.index()] else {
            return;
        };
        match read_step(conn) {
            Ok(Step::Complete(header, body)) => self.dispatch(peer, header, body),
            Ok(Step::Partial) => {}
            Ok(Step::Eof) => self.teardown(peer, false),
            Err(err) => {
                tracing::error!(
                    %peer,
                    error = &err as &dyn std::error::Error,
                    "receive failed"
                );
                self.teardown(peer, false);
            }
        }
    }

    fn dispatch(&mut self, source: NodeId, header: MessageHeader, body: Vec<u8>) {
        match header.kind {
            MessageKind::SHUTDOWN => {
                // The peer is migrating. Drop the connection now and expect
                // its successor to dial back in through the listener.
                tracing::debug!(peer = %source, "peer announced shutdown");
                self.teardown(source, true);
            }
            MessageKind::INIT => fatal(
                self.shared.local_id,
                format_args!("unexpected INIT from {source} on established connection"),
            ),
            MessageKind::FETCH_REQUEST
            | MessageKind::INVALIDATE_REQUEST
            | MessageKind::FETCH_ACK
            | MessageKind::FETCH_ACK_ACK => {
                let msg = Message {
                    kind: header.kind,
                    source_id: source,
                    message_id: header.message_id.get(),
                    body,
                };
                tracing::trace!(
                    %source,
                    kind = ?msg.kind,
                    message_id = msg.message_id,
                    "received"
                );
                self.shared.queue.add(msg);
                if let Some(hook) = &*self.shared.wakeup.lock() {
                    hook();
                }
            }
            MessageKind(other) => fatal(
                self.shared.local_id,
                format_args!("unknown message kind {other:#x} from {source}"),
            ),
        }
    }

    /// Returns a connection slot to inactive, waiting out any in-flight
    /// send. `announced` is set when the teardown is part of the SHUTDOWN
    /// rendezvous; any other loss of a peer is unrecoverable and leaves
    /// whoever was waiting on that peer blocked.
    fn teardown(&mut self, peer: NodeId, announced: bool) {
        let slot = &self.shared.slots[peer.index()];
        let expected = {
            let mut state = slot.state.lock();
            while state.sending {
                slot.cond.wait(&mut state);
            }
            let expected = announced || state.closing;
            state.writer = None;
            state.closing = false;
            expected
        };
        slot.cond.notify_all();
        self.readers[peer.index()] = None;
        if expected {
            tracing::debug!(%peer, "connection deactivated for migration");
        } else {
            tracing::error!(%peer, "peer connection lost; no recovery will be attempted");
        }
    }
}

fn fatal(local_id: NodeId, what: std::fmt::Arguments<'_>) -> ! {
    tracing::error!(%local_id, "fatal transport error: {what}");
    std::process::abort()
}

fn poll(fds: &mut [libc::pollfd]) -> io::Result<usize> {
    loop {
        // SAFETY: `fds` is a valid, initialized slice for the duration of
        // the call, and the length is its true length.
        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if r >= 0 {
            return Ok(r as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::NodeComm;
    use crate::message::AccessKind;
    use crate::message::Message;
    use crate::protocol::MessageKind;
    use node_topology::NodeId;
    use node_topology::NodeTopology;
    use node_topology::PeerAddress;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Reserves `n` distinct loopback ports. The listeners are dropped
    /// before the mesh binds them, which is racy in principle but fine for
    /// tests.
    fn local_topology(n: usize) -> Arc<NodeTopology> {
        let listeners: Vec<_> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let nodes = listeners
            .iter()
            .map(|l| PeerAddress::new("127.0.0.1", l.local_addr().unwrap().port()))
            .collect();
        Arc::new(NodeTopology::new(nodes, NodeId(0)).unwrap())
    }

    fn build_mesh(topology: &Arc<NodeTopology>, resuming: bool) -> Vec<Arc<NodeComm>> {
        let threads: Vec<_> = topology
            .ids()
            .map(|id| {
                let topology = topology.clone();
                std::thread::spawn(move || NodeComm::new(id, topology, resuming).unwrap())
            })
            .collect();
        threads
            .into_iter()
            .map(|t| Arc::new(t.join().unwrap()))
            .collect()
    }

    #[test]
    fn two_node_send_in_order() {
        let topology = local_topology(2);
        let mesh = build_mesh(&topology, false);

        for page in 0..3 {
            mesh[0].send(
                &Message::fetch_request(page, AccessKind::Read, NodeId(0)),
                NodeId(1),
            );
        }
        for _ in 0..3 {
            let msg = mesh[1].queue().remove();
            assert_eq!(msg.kind, MessageKind::FETCH_REQUEST);
            assert_eq!(msg.source_id, NodeId(0));
        }
        // message_id is per-sender monotonic.
        mesh[1].send(
            &Message::fetch_request(0, AccessKind::Read, NodeId(1)),
            NodeId(0),
        );
        mesh[1].send(
            &Message::fetch_request(1, AccessKind::Read, NodeId(1)),
            NodeId(0),
        );
        let a = mesh[0].queue().remove();
        let b = mesh[0].queue().remove();
        assert!(b.message_id > a.message_id);
    }

    #[test]
    fn three_node_broadcast() {
        let topology = local_topology(3);
        let mesh = build_mesh(&topology, false);

        mesh[2].broadcast(&Message::fetch_request(9, AccessKind::Write, NodeId(2)));
        for receiver in [&mesh[0], &mesh[1]] {
            let msg = receiver.queue().remove();
            assert_eq!(msg.kind, MessageKind::FETCH_REQUEST);
            assert_eq!(msg.source_id, NodeId(2));
        }
        // The passively-accepted direction works too.
        mesh[0].send(
            &Message::fetch_request(1, AccessKind::Read, NodeId(0)),
            NodeId(2),
        );
        assert_eq!(mesh[2].queue().remove().source_id, NodeId(0));
    }

    #[test]
    fn wakeup_hook_fires_on_delivery() {
        let topology = local_topology(2);
        let mesh = build_mesh(&topology, false);

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            mesh[1].set_wakeup(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        mesh[0].send(
            &Message::fetch_request(0, AccessKind::Read, NodeId(0)),
            NodeId(1),
        );
        mesh[1].queue().remove();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_rendezvous_and_resume() {
        let topology = local_topology(2);
        let mut mesh = build_mesh(&topology, false);
        let node1 = mesh.pop().unwrap();
        let node0 = mesh.pop().unwrap();

        // Node 0 announces shutdown; the call returns only once node 1 has
        // torn down its side and the connection has cycled to inactive.
        node0.shutdown();
        drop(node0);

        // The migrated node 0 reconnects to everyone; node 1 re-accepts
        // through its listener and rebinds the slot via INIT.
        let node0 = NodeComm::new(NodeId(0), topology.clone(), true).unwrap();
        node0.send(
            &Message::fetch_request(4, AccessKind::Write, NodeId(0)),
            NodeId(1),
        );
        let msg = node1.queue().remove();
        assert_eq!(msg.source_id, NodeId(0));
        assert_eq!(msg.kind, MessageKind::FETCH_REQUEST);

        // The re-accepted stream carries traffic the other way too, once
        // node 1's send unblocks on the slot going active again.
        node1.send(
            &Message::fetch_request(5, AccessKind::Read, NodeId(1)),
            NodeId(0),
        );
        assert_eq!(node0.queue().remove().source_id, NodeId(1));
    }

    #[test]
    fn lost_peer_leaves_slot_inactive() {
        let topology = local_topology(2);
        let mut mesh = build_mesh(&topology, false);
        let node1 = mesh.pop().unwrap();
        let node0 = mesh.pop().unwrap();

        // Kill node 1 without the SHUTDOWN handshake. Node 0's receiver
        // observes EOF, logs, and deactivates the slot; a later send blocks
        // rather than crashing.
        drop(node1);
        std::thread::sleep(Duration::from_millis(100));

        let sender = {
            let node0 = node0.clone();
            std::thread::spawn(move || {
                node0.send(
                    &Message::fetch_request(0, AccessKind::Read, NodeId(0)),
                    NodeId(1),
                );
            })
        };
        std::thread::sleep(Duration::from_millis(200));
        assert!(!sender.is_finished());
    }
}
