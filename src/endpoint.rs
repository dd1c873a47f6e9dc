//! The endpoint object: one pooled slot per network conversation.
//!
//! An endpoint wraps exactly one OS-level thing — a listening socket, an
//! accepted or connecting TCP stream, a UDP port, a UNIX-domain pipe, or one
//! end of a socketpair — and delivers its life as three callbacks:
//! *connected*, *read*, and *close*. Slots live in a state pool so that
//! allocation is O(1), exhaustion is a normal condition rather than an OOM,
//! and a freed slot can be claimed again from inside the very callback that
//! freed it.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use axon_pool::PoolState;
use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Ready;

use crate::error::{io_to_error, Error, Result, SendOutcome};
use crate::runtime::Runtime;
use crate::send::{SendBuffer, SendfileOp};
use crate::sock;

/// Size of every endpoint's input buffer.
pub const BUF_SIZE: usize = 1500;

/// Identifies an endpoint slot. Ids are stable for the life of the
/// conversation and may be reused after close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) usize);

impl EndpointId {
    /// The slot index behind this id.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ConnectedFn = Rc<dyn Fn(&mut Runtime, EndpointId)>;
pub type ReadFn = Rc<dyn Fn(&mut Runtime, EndpointId, usize)>;
pub type CloseFn = Rc<dyn Fn(&mut Runtime, EndpointId)>;
pub type WrittenFn = Rc<dyn Fn(&mut Runtime, EndpointId, SendOutcome)>;

/// The callback bundle installed on an endpoint at construction.
///
/// A read callback is mandatory; connected and close are optional, matching
/// how listeners and UDP ports never see either.
#[derive(Clone)]
pub struct EndpointEvents {
    pub(crate) connected: Option<ConnectedFn>,
    pub(crate) read: ReadFn,
    pub(crate) close: Option<CloseFn>,
}

impl EndpointEvents {
    pub fn new(read: impl Fn(&mut Runtime, EndpointId, usize) + 'static) -> Self {
        EndpointEvents {
            connected: None,
            read: Rc::new(read),
            close: None,
        }
    }

    pub fn on_connected(mut self, connected: impl Fn(&mut Runtime, EndpointId) + 'static) -> Self {
        self.connected = Some(Rc::new(connected));
        self
    }

    pub fn on_close(mut self, close: impl Fn(&mut Runtime, EndpointId) + 'static) -> Self {
        self.close = Some(Rc::new(close));
        self
    }

    pub(crate) fn noop() -> Self {
        EndpointEvents::new(|_, _, _| {})
    }
}

/// How to resume read events after a consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Synthesize a read event for whatever is buffered, on the next loop
    /// iteration.
    Immediate,
    /// Stay quiet until the peer sends more.
    WhenMoreData,
}

/// Endpoint slot lifecycle, as pool states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Free,
    Used,
    Deferred,
}

impl PoolState for Lifecycle {
    const COUNT: usize = 3;

    fn from_index(index: usize) -> Self {
        match index {
            0 => Lifecycle::Free,
            1 => Lifecycle::Used,
            2 => Lifecycle::Deferred,
            _ => unreachable!("no such lifecycle state"),
        }
    }

    fn into_index(self) -> usize {
        self as usize
    }
}

/// A user callback postponed to the next loop iteration, so it cannot
/// re-enter whatever OS callback requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferredEvent {
    /// Deliver the connected callback (socketpairs, pipe connects).
    Connected,
    /// Deliver a synthetic read event for the buffered bytes.
    ResumeRead,
    /// Drain plaintext already sitting inside the TLS engine.
    SslDrain,
}

/// What the poll readiness for this endpoint currently means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoRole {
    Idle,
    Accept,
    Connect,
    Read,
    Drain,
    NotifyWritable,
    Sendfile,
    Ssl,
}

pub(crate) enum Transport {
    None,
    TcpListener(TcpListener),
    Tcp(TcpStream),
    Udp(UdpSocket),
    UnixListener(UnixListener),
    Unix(UnixStream),
    /// The socket has moved into the TLS session slot.
    Ssl,
}

impl Transport {
    pub(crate) fn fd(&self) -> Option<RawFd> {
        match self {
            Transport::None | Transport::Ssl => None,
            Transport::TcpListener(l) => Some(l.as_raw_fd()),
            Transport::Tcp(s) => Some(s.as_raw_fd()),
            Transport::Udp(s) => Some(s.as_raw_fd()),
            Transport::UnixListener(l) => Some(l.as_raw_fd()),
            Transport::Unix(s) => Some(s.as_raw_fd()),
        }
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Transport::None)
    }
}

pub(crate) struct EndpointSlot {
    pub(crate) transport: Transport,
    pub(crate) role: IoRole,
    pub(crate) registered: Option<Ready>,
    pub(crate) is_stream: bool,
    pub(crate) oneshot: bool,
    pub(crate) paused: bool,
    pub(crate) read_stopped: bool,
    pub(crate) ssl_enabled: bool,
    pub(crate) local_addr: Option<SocketAddrV4>,
    pub(crate) peer_addr: Option<SocketAddrV4>,
    pub(crate) path: Option<PathBuf>,
    pub(crate) in_buf: Box<[u8; BUF_SIZE]>,
    pub(crate) in_total: usize,
    pub(crate) in_consumed: usize,
    pub(crate) events: EndpointEvents,
    pub(crate) send_list: VecDeque<SendBuffer>,
    pub(crate) written_cb: Option<WrittenFn>,
    pub(crate) sendfile: Option<SendfileOp>,
    pub(crate) ssl_session: Option<usize>,
    pub(crate) deferred: Option<DeferredEvent>,
    pub(crate) next_socket: Option<OwnedFd>,
    pub(crate) user_data: Option<Box<dyn Any>>,
}

impl EndpointSlot {
    pub(crate) fn empty() -> Self {
        EndpointSlot {
            transport: Transport::None,
            role: IoRole::Idle,
            registered: None,
            is_stream: false,
            oneshot: false,
            paused: false,
            read_stopped: false,
            ssl_enabled: false,
            local_addr: None,
            peer_addr: None,
            path: None,
            in_buf: Box::new([0; BUF_SIZE]),
            in_total: 0,
            in_consumed: 0,
            events: EndpointEvents::noop(),
            send_list: VecDeque::new(),
            written_cb: None,
            sendfile: None,
            ssl_session: None,
            deferred: None,
            next_socket: None,
            user_data: None,
        }
    }

    /// Reinitializes a claimed slot, keeping the input buffer allocation.
    pub(crate) fn reset(&mut self, events: EndpointEvents, is_stream: bool) {
        self.transport = Transport::None;
        self.role = IoRole::Idle;
        self.registered = None;
        self.is_stream = is_stream;
        self.oneshot = false;
        self.paused = false;
        self.read_stopped = false;
        self.ssl_enabled = false;
        self.local_addr = None;
        self.peer_addr = None;
        self.path = None;
        self.in_total = 0;
        self.in_consumed = 0;
        self.events = events;
        self.send_list.clear();
        self.written_cb = None;
        self.sendfile = None;
        self.ssl_session = None;
        self.deferred = None;
        self.next_socket = None;
        self.user_data = None;
    }

    pub(crate) fn used(&self) -> &[u8] {
        &self.in_buf[self.in_consumed..self.in_total]
    }
}

impl Runtime {
    /// Claims a slot for a TCP endpoint bound (or to be bound) to `local`.
    ///
    /// Use `0.0.0.0` for any interface and port 0 for an OS-assigned port;
    /// binding happens at [`listen`](Runtime::listen) or
    /// [`connect`](Runtime::connect) time.
    pub fn new_tcp(&mut self, local: SocketAddrV4, events: EndpointEvents) -> Result<EndpointId> {
        let id = self.claim(events, true)?;
        self.endpoints.get_mut(id).local_addr = Some(local);
        trace!("endpoint {}: new tcp endpoint on {}", id, local);
        Ok(EndpointId(id))
    }

    /// Claims a slot for a UDP endpoint on `local`.
    pub fn new_udp(&mut self, local: SocketAddrV4, events: EndpointEvents) -> Result<EndpointId> {
        let id = self.claim(events, false)?;
        self.endpoints.get_mut(id).local_addr = Some(local);
        trace!("endpoint {}: new udp endpoint on {}", id, local);
        Ok(EndpointId(id))
    }

    /// Claims a slot for a UNIX-domain pipe endpoint at `path`.
    pub fn new_pipe(&mut self, path: impl AsRef<Path>, events: EndpointEvents) -> Result<EndpointId> {
        let id = self.claim(events, true)?;
        self.endpoints.get_mut(id).path = Some(path.as_ref().to_path_buf());
        trace!("endpoint {}: new pipe endpoint at {:?}", id, path.as_ref());
        Ok(EndpointId(id))
    }

    /// Starts listening (TCP, pipe) or binds and starts receiving (UDP).
    pub fn listen(&mut self, id: EndpointId) -> Result<()> {
        self.listen_with(id, false)
    }

    /// Listens for exactly one connection; the listener slot itself becomes
    /// the accepted connection and stops listening.
    pub fn listen_oneshot(&mut self, id: EndpointId) -> Result<()> {
        self.listen_with(id, true)
    }

    fn listen_with(&mut self, id: EndpointId, oneshot: bool) -> Result<()> {
        let backlog = self.listen_backlog;
        let slot = self.used_slot(id)?;

        if !slot.transport.is_none() {
            warn!("endpoint {}: listener is already in use", id);
            return Err(Error::Internal);
        }

        if let Some(path) = slot.path.clone() {
            // A stale socket file would make bind fail with EADDRINUSE.
            let _ = std::fs::remove_file(&path);

            let listener = UnixListener::bind(&path).map_err(|e| {
                warn!("endpoint {}: cannot listen on {:?}: {}", id, path, e);
                io_to_error(&e)
            })?;
            listener.set_nonblocking(true).map_err(|e| {
                warn!("endpoint {}: cannot set pipe non-blocking: {}", id, e);
                Error::Internal
            })?;

            let slot = self.endpoints.get_mut(id.0);
            slot.oneshot = oneshot;
            slot.transport = Transport::UnixListener(listener);
            self.watch(id.0, Ready::readable(), IoRole::Accept)?;
            debug!("endpoint {}: listening on pipe {:?}", id, path);
            return Ok(());
        }

        let local = slot.local_addr.unwrap_or_else(|| {
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
        });

        if slot.is_stream {
            let listener = sock::tcp_listener(local, backlog).map_err(|e| {
                warn!("endpoint {}: cannot listen on {}: {}", id, local, e);
                io_to_error(&e)
            })?;

            let slot = self.endpoints.get_mut(id.0);
            slot.oneshot = oneshot;
            slot.transport = Transport::TcpListener(listener);
            self.watch(id.0, Ready::readable(), IoRole::Accept)?;
            debug!("endpoint {}: listening on {} (backlog {})", id, local, backlog);
        } else {
            let socket = sock::udp_socket(local).map_err(|e| {
                warn!("endpoint {}: cannot bind udp {}: {}", id, local, e);
                io_to_error(&e)
            })?;

            let slot = self.endpoints.get_mut(id.0);
            slot.transport = Transport::Udp(socket);
            self.watch(id.0, Ready::readable(), IoRole::Read)?;
            debug!("endpoint {}: receiving udp on {}", id, local);
        }

        Ok(())
    }

    /// Changes the backlog used by subsequent `listen` calls.
    pub fn set_listen_backlog(&mut self, backlog: i32) {
        debug!("listen backlog was {}; now {}", self.listen_backlog, backlog);
        self.listen_backlog = backlog;
    }

    /// Starts a non-blocking connect to `peer`. The connected callback (or
    /// the close callback, on failure) reports the outcome.
    pub fn connect(&mut self, id: EndpointId, peer: SocketAddrV4) -> Result<()> {
        let slot = self.used_slot(id)?;

        if !slot.transport.is_none() {
            warn!("endpoint {}: connection is already in use", id);
            return Err(Error::AlreadyConnected);
        }

        if !slot.is_stream {
            warn!("endpoint {}: connect on a non-stream endpoint", id);
            return Err(Error::Internal);
        }

        // When connecting, only bind if the caller picked a concrete local
        // address; the stack assigns one otherwise.
        let local = slot.local_addr.filter(|a| {
            *a.ip() != Ipv4Addr::UNSPECIFIED || a.port() != 0
        });

        let stream = sock::tcp_connect(local, peer).map_err(|e| {
            warn!("endpoint {}: connect to {} failed: {}", id, peer, e);
            io_to_error(&e)
        })?;

        let slot = self.endpoints.get_mut(id.0);
        slot.peer_addr = Some(peer);
        slot.transport = Transport::Tcp(stream);
        self.watch(id.0, Ready::writable(), IoRole::Connect)?;
        debug!("endpoint {}: connect to {} in progress", id, peer);
        Ok(())
    }

    /// Completion of a non-blocking connect: read `SO_ERROR` and either wire
    /// the endpoint up as a reader or report the failure as a close.
    pub(crate) fn on_connect_ready(&mut self, ix: usize) {
        let error = match &self.endpoints.get(ix).transport {
            Transport::Tcp(stream) => stream.take_error().unwrap_or_else(|e| Some(e)),
            _ => return,
        };

        if let Some(err) = error {
            let id = EndpointId(ix);
            debug!(
                "endpoint {}: failed to connect to {:?}: {}",
                id,
                self.endpoints.get(ix).peer_addr,
                err
            );
            let close = self.endpoints.get(ix).events.close.clone();

            if let Some(close) = close {
                close(self, id);
            }

            // The callback may have closed it already; close is idempotent.
            let _ = self.close(id);
            return;
        }

        if let Err(e) = self.watch(ix, Ready::readable(), IoRole::Read) {
            warn!("endpoint {}: cannot watch connected socket: {}", ix, e);
            return;
        }

        if self.endpoints.get(ix).ssl_enabled {
            self.ssl_start_client(ix);
            return;
        }

        trace!("endpoint {}: connection complete", ix);
        let connected = self.endpoints.get(ix).events.connected.clone();

        if let Some(connected) = connected {
            connected(self, EndpointId(ix));
        }
    }

    /// Accept readiness on a listener: drain the queue, minting one endpoint
    /// per connection.
    pub(crate) fn on_accept_ready(&mut self, ix: usize) {
        loop {
            let oneshot = self.endpoints.get(ix).oneshot;

            let accepted = match &self.endpoints.get(ix).transport {
                Transport::TcpListener(listener) => match listener.accept() {
                    Ok((stream, peer)) => Some((Transport::Tcp(stream), sock::as_v4(peer))),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        warn!("endpoint {}: accept failed: {}", ix, e);
                        None
                    }
                },
                Transport::UnixListener(listener) => match listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!("endpoint {}: accepted pipe unusable: {}", ix, e);
                            continue;
                        }
                        Some((Transport::Unix(stream), None))
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        warn!("endpoint {}: accept failed: {}", ix, e);
                        None
                    }
                },
                _ => return,
            };

            let (transport, peer) = match accepted {
                Some(pair) => pair,
                None => return,
            };

            let that = if oneshot {
                debug!("endpoint {}: one-shot listener becomes the connection", ix);
                self.unwatch(ix);
                let slot = self.endpoints.get_mut(ix);
                slot.transport = transport;
                slot.oneshot = false;
                slot.local_addr = None;
                ix
            } else {
                let (events, path, ssl_enabled) = {
                    let parent = self.endpoints.get(ix);
                    (parent.events.clone(), parent.path.clone(), parent.ssl_enabled)
                };

                match self.claim(events, true) {
                    Ok(that) => {
                        let slot = self.endpoints.get_mut(that);
                        slot.transport = transport;
                        slot.path = path;
                        slot.ssl_enabled = ssl_enabled;
                        that
                    }
                    Err(_) => {
                        warn!(
                            "endpoint {}: out of endpoints; dropping accepted connection",
                            ix
                        );
                        // transport is dropped here, closing the raw fd
                        continue;
                    }
                }
            };

            {
                let slot = self.endpoints.get_mut(that);
                slot.peer_addr = peer;
            }

            if let Err(e) = self.watch(that, Ready::readable(), IoRole::Read) {
                warn!("endpoint {}: cannot watch accepted connection: {}", that, e);
                let _ = self.close(EndpointId(that));
                continue;
            }

            trace!("endpoint {}: accepted connection from {:?}", that, peer);

            if self.endpoints.get(that).ssl_enabled {
                self.ssl_start_server(that);
            } else {
                let connected = self.endpoints.get(that).events.connected.clone();

                if let Some(connected) = connected {
                    connected(self, EndpointId(that));
                }
            }

            // One-shot listeners and pipes accept a single connection per
            // readiness; normal TCP listeners keep draining the queue.
            let is_pipe = self.endpoints.get(ix).path.is_some()
                || !matches!(self.endpoints.get(ix).transport, Transport::TcpListener(_));

            if that == ix || is_pipe {
                return;
            }
        }
    }

    /// Closes the endpoint and returns its slot to the pool.
    ///
    /// Idempotent: closing twice earns a warning, not a fault. Pending send
    /// completion callbacks fire with a failure before the slot is freed.
    pub fn close(&mut self, id: EndpointId) -> Result<()> {
        match self.endpoints.state_of(id.0) {
            Lifecycle::Free => {
                debug!("endpoint {}: ignoring close of a free endpoint", id);
                return Err(Error::AlreadyClosed);
            }
            Lifecycle::Used | Lifecycle::Deferred => {}
        }

        if self.endpoints.get(id.0).ssl_session.is_some() {
            return self.ssl_close_endpoint(id.0);
        }

        self.close_with_failure(id.0, Error::NoConnection);
        Ok(())
    }

    /// Tears a slot down and frees it, failing any pending completion
    /// callbacks with `err`.
    pub(crate) fn close_with_failure(&mut self, ix: usize, err: Error) {
        self.unwatch(ix);

        let mut pending: Vec<(WrittenFn, SendOutcome)> = Vec::new();

        {
            let slot = self.endpoints.get_mut(ix);

            while let Some(buffer) = slot.send_list.pop_front() {
                if let Some(cb) = buffer.into_callback() {
                    pending.push((cb, SendOutcome::Failed(err)));
                }
            }

            if let Some(cb) = slot.written_cb.take() {
                pending.push((cb, SendOutcome::Failed(err)));
            }

            slot.transport = Transport::None;
            slot.role = IoRole::Idle;
            slot.sendfile = None;
            slot.deferred = None;
            slot.next_socket = None;
            slot.in_total = 0;
            slot.in_consumed = 0;
            slot.paused = false;
            slot.read_stopped = false;
            slot.oneshot = false;
            slot.ssl_enabled = false;

            // The close callback survives so a peer-driven close can still be
            // reported; connected and read callbacks are dead from here on.
            slot.events.connected = None;
            slot.events.read = Rc::new(|_, _, _| {});
        }

        #[cfg(feature = "ssl")]
        self.ssl_release_session(ix);

        for (cb, outcome) in pending {
            cb(self, EndpointId(ix), outcome);
        }

        let state = self.endpoints.state_of(ix);

        if state != Lifecycle::Free {
            self.endpoints.set_state(ix, state, Lifecycle::Free);
            trace!("endpoint {}: closed", ix);
        }
    }

    /// The peer (or the stack) ended the stream: free the slot first so it
    /// can be reused from inside the callback, then report the close.
    pub(crate) fn stream_closed(&mut self, ix: usize) {
        let close = self.endpoints.get(ix).events.close.clone();
        self.close_with_failure(ix, Error::NoConnection);

        if let Some(close) = close {
            close(self, EndpointId(ix));
        } else {
            trace!("endpoint {}: no close callback to report to", ix);
        }
    }

    // ---- accessors ------------------------------------------------------

    /// Whether the id refers to a live (non-free) endpoint.
    pub fn is_open(&self, id: EndpointId) -> bool {
        id.0 < self.endpoints.len() && self.endpoints.state_of(id.0) != Lifecycle::Free
    }

    /// The unconsumed bytes currently buffered for reading.
    pub fn buf(&self, id: EndpointId) -> &[u8] {
        self.endpoints.get(id.0).used()
    }

    /// Number of buffered bytes the user has not yet consumed.
    pub fn buf_used(&self, id: EndpointId) -> usize {
        let slot = self.endpoints.get(id.0);
        slot.in_total - slot.in_consumed
    }

    /// The peer address, when the endpoint has one (connected TCP, or the
    /// source of the last UDP datagram).
    pub fn peer_addr(&self, id: EndpointId) -> Option<SocketAddrV4> {
        self.endpoints.get(id.0).peer_addr
    }

    pub fn peer_port(&self, id: EndpointId) -> Option<u16> {
        self.peer_addr(id).map(|a| a.port())
    }

    /// The local address, resolving an OS-assigned port on first use.
    pub fn local_addr(&mut self, id: EndpointId) -> Result<SocketAddrV4> {
        let slot = self.used_slot(id)?;

        if slot.path.is_some() {
            warn!("endpoint {}: local_addr on a pipe endpoint", id);
            return Err(Error::Internal);
        }

        if let Some(addr) = slot.local_addr {
            if addr.port() != 0 {
                return Ok(addr);
            }
        }

        let resolved = match &slot.transport {
            Transport::TcpListener(l) => l.local_addr().ok().and_then(sock::as_v4),
            Transport::Tcp(s) => s.local_addr().ok().and_then(sock::as_v4),
            Transport::Udp(s) => s.local_addr().ok().and_then(sock::as_v4),
            _ => None,
        };

        match resolved {
            Some(addr) => {
                self.endpoints.get_mut(id.0).local_addr = Some(addr);
                Ok(addr)
            }
            None => self.endpoints.get(id.0).local_addr.ok_or(Error::NoConnection),
        }
    }

    pub fn local_port(&mut self, id: EndpointId) -> Result<u16> {
        self.local_addr(id).map(|a| a.port())
    }

    /// The pipe path, for UNIX-domain endpoints.
    pub fn path(&self, id: EndpointId) -> Option<&Path> {
        self.endpoints.get(id.0).path.as_deref()
    }

    /// Attaches opaque per-endpoint data. Replaced data is returned.
    pub fn set_user_data(&mut self, id: EndpointId, data: Box<dyn Any>) -> Option<Box<dyn Any>> {
        self.endpoints.get_mut(id.0).user_data.replace(data)
    }

    pub fn user_data(&self, id: EndpointId) -> Option<&(dyn Any + 'static)> {
        self.endpoints.get(id.0).user_data.as_deref()
    }

    pub fn user_data_mut(&mut self, id: EndpointId) -> Option<&mut (dyn Any + 'static)> {
        match self.endpoints.get_mut(id.0).user_data {
            Some(ref mut data) => Some(data.as_mut()),
            None => None,
        }
    }

    pub fn take_user_data(&mut self, id: EndpointId) -> Option<Box<dyn Any>> {
        self.endpoints.get_mut(id.0).user_data.take()
    }

    // ---- internals ------------------------------------------------------

    pub(crate) fn claim(&mut self, events: EndpointEvents, is_stream: bool) -> Result<usize> {
        let id = self
            .endpoints
            .set_oldest_state(Lifecycle::Free, Lifecycle::Used)
            .ok_or_else(|| {
                warn!("out of endpoints; raise the endpoint count at build time");
                Error::NoUnusedElements
            })?;

        self.endpoints.get_mut(id).reset(events, is_stream);
        Ok(id)
    }

    pub(crate) fn used_slot(&self, id: EndpointId) -> Result<&EndpointSlot> {
        if id.0 >= self.endpoints.len() || self.endpoints.state_of(id.0) == Lifecycle::Free {
            warn!("endpoint {}: operation on a free endpoint", id);
            return Err(Error::Internal);
        }

        Ok(self.endpoints.get(id.0))
    }
}
