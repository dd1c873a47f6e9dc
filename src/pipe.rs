//! UNIX-domain pipes, socketpairs, and file-descriptor passing.
//!
//! A pipe endpoint carries a byte stream and, via `SCM_RIGHTS` ancillary
//! messages, at most one file descriptor per message. A received descriptor
//! is parked on the endpoint; the moment the pipe's receive queue runs dry,
//! the endpoint closes the pipe and transparently rebinds itself to the
//! received socket, so an established conversation migrates from a local
//! control channel onto a handed-over TCP connection without the caller
//! noticing.

use std::io::{IoSlice, IoSliceMut};
use std::net;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::Ready;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::endpoint::{DeferredEvent, EndpointEvents, EndpointId, IoRole, Transport, BUF_SIZE};
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::sock;

impl Runtime {
    /// Claims a connected socketpair endpoint, returning the endpoint and
    /// the peer end of the pair.
    ///
    /// The connected callback is delivered on the next loop iteration, once
    /// the caller has had a chance to hand the peer end away (typically to a
    /// spawned child).
    pub fn new_socketpair(&mut self, events: EndpointEvents) -> Result<(EndpointId, UnixStream)> {
        let (ours, theirs) = UnixStream::pair().map_err(|e| {
            warn!("socketpair failed: {}", e);
            Error::Internal
        })?;

        ours.set_nonblocking(true).map_err(|e| {
            warn!("cannot set socketpair non-blocking: {}", e);
            Error::Internal
        })?;

        let ix = self.claim(events, true)?;
        self.endpoints.get_mut(ix).transport = Transport::Unix(ours);

        if let Err(e) = self.watch(ix, Ready::readable(), IoRole::Read) {
            self.close_with_failure(ix, Error::NoConnection);
            return Err(e);
        }

        self.defer(ix, DeferredEvent::Connected);
        trace!("endpoint {}: socketpair ready", ix);
        Ok((EndpointId(ix), theirs))
    }

    /// Connects a pipe endpoint to the UNIX-domain socket at its path.
    ///
    /// UNIX-domain connects complete (or fail) immediately; the connected
    /// callback is still delivered through the deferred queue so it arrives
    /// outside the caller's stack frame.
    pub fn connect_pipe(&mut self, id: EndpointId) -> Result<()> {
        let slot = self.used_slot(id)?;

        if !slot.transport.is_none() {
            warn!("endpoint {}: pipe is already connected", id);
            return Err(Error::AlreadyConnected);
        }

        let path = match slot.path.clone() {
            Some(path) => path,
            None => {
                warn!("endpoint {}: connect_pipe on a non-pipe endpoint", id);
                return Err(Error::Internal);
            }
        };

        let stream = UnixStream::connect(&path).map_err(|e| {
            debug!("endpoint {}: cannot connect pipe {:?}: {}", id, path, e);

            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                Error::NoConnection
            } else {
                Error::Internal
            }
        })?;

        stream.set_nonblocking(true).map_err(|e| {
            warn!("endpoint {}: cannot set pipe non-blocking: {}", id, e);
            Error::Internal
        })?;

        self.endpoints.get_mut(id.0).transport = Transport::Unix(stream);
        self.watch(id.0, Ready::readable(), IoRole::Read)?;
        self.defer(id.0, DeferredEvent::Connected);
        debug!("endpoint {}: pipe connected to {:?}", id, path);
        Ok(())
    }

    /// Sends one byte range over a pipe with one file descriptor attached.
    ///
    /// The descriptor is duplicated into the receiver by the kernel; the
    /// caller keeps (and should close) its own copy. Closing the pipe once
    /// the receiver acknowledges the payload is the usual handshake.
    pub fn write_pipe(&mut self, id: EndpointId, data: &[u8], fd: RawFd) -> Result<()> {
        let slot = self.used_slot(id)?;

        if slot.path.is_none() {
            warn!("endpoint {}: write_pipe on a non-pipe endpoint", id);
            return Err(Error::Internal);
        }

        if data.is_empty() {
            warn!("endpoint {}: write_pipe needs at least one byte", id);
            return Err(Error::Internal);
        }

        let sock_fd = match slot.transport.fd() {
            Some(fd) => fd,
            None => return Err(Error::NoConnection),
        };

        let fds = [fd];
        let control = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(data)];

        match sendmsg::<()>(sock_fd, &iov, &control, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                warn!(
                    "endpoint {}: pipe write truncated to {} of {} bytes",
                    id,
                    n,
                    data.len()
                );
                Ok(())
            }
            Err(e) => {
                warn!("endpoint {}: error writing to pipe: {}", id, e);
                Err(Error::WriteFailed)
            }
        }
    }

    /// Read readiness on a pipe: one `recvmsg`, harvesting any passed
    /// descriptor, then the rebind check.
    pub(crate) fn read_pipe_message(&mut self, ix: usize) {
        let (result, passed_fd) = {
            let slot = self.endpoints.get_mut(ix);
            let total = slot.in_total;

            let sock_fd = match slot.transport.fd() {
                Some(fd) => fd,
                None => return,
            };

            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let mut iov = [IoSliceMut::new(&mut slot.in_buf[total..])];

            match recvmsg::<UnixAddr>(sock_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
                Ok(msg) => {
                    let mut passed = None;

                    if let Ok(cmsgs) = msg.cmsgs() {
                        for cmsg in cmsgs {
                            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                                passed = fds.first().copied();
                            }
                        }
                    }

                    (Ok(msg.bytes), passed)
                }
                Err(e) => (Err(e), None),
            }
        };

        if let Some(fd) = passed_fd {
            // Safety: SCM_RIGHTS delivered a fresh descriptor we now own.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let slot = self.endpoints.get_mut(ix);

            if slot.next_socket.is_some() {
                warn!("endpoint {}: received a second fd on pipe; replacing the first", ix);
            }

            trace!("endpoint {}: received fd {} on pipe", ix, fd.as_raw_fd());
            slot.next_socket = Some(fd);
        }

        match result {
            Ok(0) => {
                trace!("endpoint {}: pipe closed by peer", ix);
                self.stream_closed(ix);
            }
            Ok(n) => {
                self.maybe_adopt_next_socket(ix);
                self.handle_read_data(ix, n, None);
            }
            Err(Errno::EAGAIN) => {}
            Err(e) => {
                debug!("endpoint {}: failed to read from pipe: {}", ix, e);
                self.stream_closed(ix);
            }
        }
    }

    /// If a passed descriptor is parked and the pipe has no more queued
    /// data, swap the endpoint over to the received socket.
    fn maybe_adopt_next_socket(&mut self, ix: usize) {
        let pipe_fd = {
            let slot = self.endpoints.get(ix);

            if slot.next_socket.is_none() {
                return;
            }

            match slot.transport.fd() {
                Some(fd) => fd,
                None => return,
            }
        };

        match sock::bytes_readable(pipe_fd) {
            Some(0) => {}
            Some(_) => return,
            None => {
                warn!("endpoint {}: cannot query pipe queue depth", ix);
                return;
            }
        }

        debug!("endpoint {}: pipe drained; switching to received socket", ix);
        self.unwatch(ix);

        let stream = {
            let slot = self.endpoints.get_mut(ix);
            let next = slot.next_socket.take().expect("next_socket checked above");
            slot.transport = Transport::None; // closes the pipe fd
            slot.path = None;
            slot.is_stream = true;
            net::TcpStream::from(next)
        };

        if let Err(e) = stream.set_nonblocking(true) {
            warn!("endpoint {}: received socket unusable: {}", ix, e);
            self.stream_closed(ix);
            return;
        }

        let peer = stream.peer_addr().ok().and_then(sock::as_v4);

        let stream = match TcpStream::from_stream(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("endpoint {}: received socket unusable: {}", ix, e);
                self.stream_closed(ix);
                return;
            }
        };

        {
            let slot = self.endpoints.get_mut(ix);
            slot.transport = Transport::Tcp(stream);

            if peer.is_some() {
                slot.peer_addr = peer;
            }
        }

        let _ = self.watch(ix, Ready::readable(), IoRole::Read);
        trace!("endpoint {}: now using the received socket", ix);
    }
}
