//! The buffered write pipeline.
//!
//! Writes always go through the endpoint's send list. Each queued buffer is
//! borrowed from the caller for the duration of the send: the per-buffer
//! completion callback is the release point, and it fires exactly once —
//! on success, on send failure, and on close with the send still pending.

use std::fs::File;
use std::io::Write;
use std::net::SocketAddrV4;
use std::os::unix::io::AsRawFd;

use bytes::Bytes;
use log::{debug, trace, warn};
use mio::Ready;

use crate::endpoint::{EndpointId, IoRole, Lifecycle, Transport, WrittenFn};
use crate::error::{io_to_error, Error, Result, SendOutcome, SendStatus};
use crate::runtime::Runtime;

/// One pending write: the data, how much of it has reached the OS, and the
/// optional release callback.
pub struct SendBuffer {
    pub(crate) data: Bytes,
    pub(crate) consumed: usize,
    pub(crate) on_done: Option<WrittenFn>,
}

impl SendBuffer {
    /// A buffer with no completion callback, for fire-and-forget data.
    pub fn new(data: impl Into<Bytes>) -> Self {
        SendBuffer {
            data: data.into(),
            consumed: 0,
            on_done: None,
        }
    }

    /// A buffer whose callback is invoked once the runtime is done with it,
    /// in completion order, carrying the outcome.
    pub fn with_callback(
        data: impl Into<Bytes>,
        on_done: impl Fn(&mut Runtime, EndpointId, SendOutcome) + 'static,
    ) -> Self {
        SendBuffer {
            data: data.into(),
            consumed: 0,
            on_done: Some(std::rc::Rc::new(on_done)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.consumed
    }

    pub(crate) fn into_callback(self) -> Option<WrittenFn> {
        self.on_done
    }
}

/// An in-flight sendfile: source file, kernel-maintained offset, bytes left.
pub(crate) struct SendfileOp {
    pub(crate) file: File,
    pub(crate) offset: libc::off_t,
    pub(crate) remaining: usize,
    pub(crate) on_done: WrittenFn,
}

/// What one attempt to push bytes at the transport did.
pub(crate) enum WriteStep {
    Wrote(usize),
    /// Progress is blocked; the watcher has been armed for whatever the
    /// transport is waiting on.
    Blocked,
    Failed(Error),
}

impl Runtime {
    /// Queues one buffer and drains as much of the send list as the socket
    /// allows right now.
    pub fn send_buffer(&mut self, id: EndpointId, buffer: SendBuffer) -> Result<SendStatus> {
        self.used_slot(id)?;

        if self.endpoints.get(id.0).sendfile.is_some() {
            warn!("endpoint {}: send while a sendfile is pending", id);
            return Err(Error::Internal);
        }

        self.endpoints.get_mut(id.0).send_list.push_back(buffer);
        let status = self.drain_send_list(id.0)?;

        // A synchronous drain while the write watcher was armed from an
        // earlier episode leaves it pointing the wrong way.
        if status == SendStatus::Complete
            && self.is_open(id)
            && self.endpoints.get(id.0).role == IoRole::Drain
        {
            self.rearm_after_send(id.0);
        }

        Ok(status)
    }

    /// Queues several buffers; `on_complete` fires once when every one of
    /// them has drained — unless the whole list drains synchronously, in
    /// which case `Ok(SendStatus::Complete)` is the only notification.
    pub fn send_buffers(
        &mut self,
        id: EndpointId,
        buffers: Vec<SendBuffer>,
        on_complete: impl Fn(&mut Runtime, EndpointId, SendOutcome) + 'static,
    ) -> Result<SendStatus> {
        self.used_slot(id)?;

        if self.endpoints.get(id.0).sendfile.is_some() {
            warn!("endpoint {}: send while a sendfile is pending", id);
            return Err(Error::Internal);
        }

        {
            let slot = self.endpoints.get_mut(id.0);
            slot.send_list.extend(buffers);
            slot.written_cb = Some(std::rc::Rc::new(on_complete));
        }

        let status = self.drain_send_list(id.0)?;

        if status == SendStatus::Complete && self.is_open(id) {
            self.endpoints.get_mut(id.0).written_cb = None;

            if self.endpoints.get(id.0).role == IoRole::Drain {
                self.rearm_after_send(id.0);
            }
        }

        Ok(status)
    }

    /// Copies `data` and sends it. Convenience form of
    /// [`Runtime::send_buffer`].
    pub fn write(&mut self, id: EndpointId, data: &[u8]) -> Result<SendStatus> {
        self.send_buffer(id, SendBuffer::new(Bytes::copy_from_slice(data)))
    }

    /// Sends one datagram from a UDP endpoint.
    pub fn write_to(&mut self, id: EndpointId, data: &[u8], dest: SocketAddrV4) -> Result<()> {
        let slot = self.used_slot(id)?;

        let result = match &slot.transport {
            Transport::Udp(socket) => socket.send_to(data, &std::net::SocketAddr::V4(dest)),
            _ => {
                warn!("endpoint {}: write_to on a non-UDP endpoint", id);
                return Err(Error::Internal);
            }
        };

        match result {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                warn!("endpoint {}: only {} of {} bytes written", id, n, data.len());
                Err(Error::WriteFailed)
            }
            Err(e) => {
                debug!("endpoint {}: error writing datagram: {}", id, e);
                Err(Error::WriteFailed)
            }
        }
    }

    /// Arms the write watcher without sending anything and calls `cb` once
    /// the socket reports writable.
    pub fn notify_writable(
        &mut self,
        id: EndpointId,
        cb: impl Fn(&mut Runtime, EndpointId, SendOutcome) + 'static,
    ) -> Result<()> {
        self.used_slot(id)?;
        self.endpoints.get_mut(id.0).written_cb = Some(std::rc::Rc::new(cb));
        self.watch(id.0, Ready::writable(), IoRole::NotifyWritable)
    }

    /// Zero-copy send of up to `total` bytes of `file` starting at `offset`.
    ///
    /// Partial progress re-arms on write readiness until `total` bytes have
    /// gone out (`SendOutcome::Ok`), the file ends early
    /// (`SendOutcome::EndOfFile`), or the send fails. `on_complete` always
    /// fires exactly once. A sendfile and a buffered send cannot overlap.
    pub fn sendfile(
        &mut self,
        id: EndpointId,
        file: File,
        offset: u64,
        total: usize,
        on_complete: impl Fn(&mut Runtime, EndpointId, SendOutcome) + 'static,
    ) -> Result<SendStatus> {
        self.used_slot(id)?;

        let slot = self.endpoints.get(id.0);

        if slot.ssl_session.is_some() {
            warn!("endpoint {}: sendfile on a TLS endpoint; use send_buffer", id);
            return Err(Error::Internal);
        }

        if !slot.send_list.is_empty() || slot.sendfile.is_some() {
            warn!("endpoint {}: sendfile while another send is pending", id);
            return Err(Error::Internal);
        }

        if total == 0 {
            warn!("endpoint {}: sendfile of zero bytes", id);
            return Err(Error::Internal);
        }

        self.endpoints.get_mut(id.0).sendfile = Some(SendfileOp {
            file,
            offset: offset as libc::off_t,
            remaining: total,
            on_done: std::rc::Rc::new(on_complete),
        });

        self.sendfile_step(id.0)
    }

    // ---- readiness handlers ---------------------------------------------

    /// Write readiness while buffers are queued: keep draining.
    pub(crate) fn on_drain_ready(&mut self, ix: usize) {
        match self.drain_send_list(ix) {
            Ok(SendStatus::InProgress) => {}
            Ok(SendStatus::Complete) => {
                if self.endpoints.state_of(ix) == Lifecycle::Free {
                    return;
                }

                self.rearm_after_send(ix);

                let cb = self.endpoints.get_mut(ix).written_cb.take();

                if let Some(cb) = cb {
                    cb(self, EndpointId(ix), SendOutcome::Ok);
                }
            }
            Err(_) => {
                // Failure already closed the endpoint and notified everyone.
            }
        }
    }

    pub(crate) fn on_notify_ready(&mut self, ix: usize) {
        self.rearm_after_send(ix);

        let cb = self.endpoints.get_mut(ix).written_cb.take();

        if let Some(cb) = cb {
            cb(self, EndpointId(ix), SendOutcome::Ok);
        }
    }

    pub(crate) fn on_sendfile_ready(&mut self, ix: usize) {
        let _ = self.sendfile_step(ix);
    }

    // ---- the drain loop --------------------------------------------------

    /// Pushes queued buffers at the transport until the list empties or the
    /// socket pushes back. Per-buffer callbacks fire as their buffer
    /// completes, in queue order.
    pub(crate) fn drain_send_list(&mut self, ix: usize) -> Result<SendStatus> {
        loop {
            let chunk = {
                let slot = self.endpoints.get(ix);

                match slot.send_list.front() {
                    None => break,
                    Some(buffer) => {
                        if buffer.remaining() == 0 {
                            None
                        } else {
                            Some((buffer.data.clone(), buffer.consumed))
                        }
                    }
                }
            };

            let (data, consumed) = match chunk {
                None => {
                    // Zero-length or fully written head: complete it.
                    self.finish_send_head(ix);

                    if self.endpoints.state_of(ix) == Lifecycle::Free {
                        return Ok(SendStatus::Complete);
                    }

                    continue;
                }
                Some(chunk) => chunk,
            };

            let attempted = data.len() - consumed;

            match self.transport_write(ix, &data[consumed..]) {
                WriteStep::Wrote(n) => {
                    let done = {
                        let slot = self.endpoints.get_mut(ix);
                        let buffer = slot.send_list.front_mut().expect("send head vanished");
                        buffer.consumed += n;
                        buffer.remaining() == 0
                    };

                    if done {
                        trace!("endpoint {}: buffer of {} bytes fully written", ix, data.len());
                        self.finish_send_head(ix);

                        if self.endpoints.state_of(ix) == Lifecycle::Free {
                            return Ok(SendStatus::Complete);
                        }
                    } else if n < attempted {
                        trace!(
                            "endpoint {}: wrote {} of {} bytes; waiting for writable",
                            ix, n, attempted
                        );
                        let _ = self.watch(ix, Ready::writable(), IoRole::Drain);
                        return Ok(SendStatus::InProgress);
                    }
                }
                WriteStep::Blocked => return Ok(SendStatus::InProgress),
                WriteStep::Failed(err) => {
                    debug!("endpoint {}: send failed; closing", ix);
                    self.close_with_failure(ix, err);
                    return Err(err);
                }
            }
        }

        Ok(SendStatus::Complete)
    }

    /// Pops the completed head buffer and fires its release callback.
    fn finish_send_head(&mut self, ix: usize) {
        let cb = {
            let slot = self.endpoints.get_mut(ix);

            match slot.send_list.pop_front() {
                Some(buffer) => buffer.into_callback(),
                None => None,
            }
        };

        if let Some(cb) = cb {
            cb(self, EndpointId(ix), SendOutcome::Ok);
        }
    }

    /// One attempt to hand bytes to the OS.
    fn transport_write(&mut self, ix: usize, data: &[u8]) -> WriteStep {
        if matches!(self.endpoints.get(ix).transport, Transport::Ssl) {
            return self.ssl_write_step(ix, data);
        }

        let result = {
            let slot = self.endpoints.get_mut(ix);

            match &mut slot.transport {
                Transport::Tcp(stream) => stream.write(data),
                Transport::Unix(stream) => stream.write(data),
                Transport::None => {
                    debug!("endpoint {}: send on a disconnected socket", ix);
                    return WriteStep::Failed(Error::NoConnection);
                }
                _ => {
                    warn!("endpoint {}: send on a non-stream endpoint", ix);
                    return WriteStep::Failed(Error::Internal);
                }
            }
        };

        match result {
            Ok(n) => WriteStep::Wrote(n),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                let _ = self.watch(ix, Ready::writable(), IoRole::Drain);
                WriteStep::Blocked
            }
            Err(e) => {
                debug!("endpoint {}: error writing to socket: {}", ix, e);

                match io_to_error(&e) {
                    Error::NoConnection => WriteStep::Failed(Error::NoConnection),
                    _ => WriteStep::Failed(Error::WriteFailed),
                }
            }
        }
    }

    /// Restores the read watcher after a write-side episode, honoring a
    /// full-buffer stop and TLS read gating.
    pub(crate) fn rearm_after_send(&mut self, ix: usize) {
        if self.endpoints.get(ix).ssl_session.is_some() {
            self.ssl_rearm_read(ix);
            return;
        }

        if self.endpoints.get(ix).read_stopped {
            return;
        }

        let readable = matches!(
            self.endpoints.get(ix).transport,
            Transport::Tcp(_) | Transport::Unix(_) | Transport::Udp(_)
        );

        if readable {
            let _ = self.watch(ix, Ready::readable(), IoRole::Read);
        }
    }

    fn sendfile_step(&mut self, ix: usize) -> Result<SendStatus> {
        let (sent, remaining_after) = {
            let out_fd = match self.endpoints.get(ix).transport.fd() {
                Some(fd) => fd,
                None => {
                    return self.sendfile_finish(ix, SendOutcome::Failed(Error::NoConnection));
                }
            };

            let slot = self.endpoints.get_mut(ix);
            let op = match slot.sendfile.as_mut() {
                Some(op) => op,
                None => return Ok(SendStatus::Complete),
            };

            let in_fd = op.file.as_raw_fd();

            // Safety: offset is a live off_t the kernel advances by the
            // number of bytes sent.
            let sent = unsafe { libc::sendfile(out_fd, in_fd, &mut op.offset, op.remaining) };

            if sent > 0 {
                op.remaining -= (sent as usize).min(op.remaining);
            }

            (sent, op.remaining)
        };

        if sent < 0 {
            let err = std::io::Error::last_os_error();

            if err.kind() == std::io::ErrorKind::WouldBlock {
                let _ = self.watch(ix, Ready::writable(), IoRole::Sendfile);
                return Ok(SendStatus::InProgress);
            }

            debug!("endpoint {}: sendfile failed: {}", ix, err);
            return self.sendfile_finish(ix, SendOutcome::Failed(Error::WriteFailed));
        }

        if sent == 0 {
            trace!("endpoint {}: sendfile hit end of file", ix);
            return self.sendfile_finish(ix, SendOutcome::EndOfFile);
        }

        if remaining_after == 0 {
            return self.sendfile_finish(ix, SendOutcome::Ok);
        }

        trace!(
            "endpoint {}: sendfile sent {} bytes, {} to go",
            ix, sent, remaining_after
        );
        let _ = self.watch(ix, Ready::writable(), IoRole::Sendfile);
        Ok(SendStatus::InProgress)
    }

    fn sendfile_finish(&mut self, ix: usize, outcome: SendOutcome) -> Result<SendStatus> {
        let op = self.endpoints.get_mut(ix).sendfile.take();

        if self.endpoints.state_of(ix) != Lifecycle::Free {
            self.rearm_after_send(ix);
        }

        if let Some(op) = op {
            (op.on_done)(self, EndpointId(ix), outcome);
        }

        match outcome {
            SendOutcome::Failed(err) => Err(err),
            _ => Ok(SendStatus::Complete),
        }
    }
}

// Without the ssl feature no endpoint ever reaches Transport::Ssl.
#[cfg(not(feature = "ssl"))]
impl Runtime {
    pub(crate) fn ssl_write_step(&mut self, _ix: usize, _data: &[u8]) -> WriteStep {
        WriteStep::Failed(Error::Internal)
    }

    pub(crate) fn ssl_rearm_read(&mut self, _ix: usize) {}
}
