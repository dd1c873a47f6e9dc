//! The buffered read pipeline.
//!
//! Bytes land in the endpoint's fixed input buffer and are reported to the
//! read callback as they arrive. The callback owns the pacing: it may
//! consume some or all of the bytes, pause the stream, and resume later.
//! When the buffer fills with nothing consumed, the endpoint stops asking
//! the OS for readiness until the consumer makes room; the peer feels that
//! as TCP back-pressure.

use std::io::Read;

use log::{debug, trace, warn};
use mio::Ready;

use crate::endpoint::{DeferredEvent, EndpointId, IoRole, Lifecycle, ResumeMode, Transport, BUF_SIZE};
use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// UDP sockets drain at most this many datagrams per readiness event so one
/// busy port cannot starve the rest of the loop.
const READS_PER_EVENT: i32 = 64;

impl Runtime {
    /// Read readiness dispatch.
    pub(crate) fn on_read_ready(&mut self, ix: usize) {
        // With a full, unconsumed buffer the watcher should be off; a stray
        // event must not be misread as EOF.
        if self.endpoints.get(ix).in_total == BUF_SIZE {
            return;
        }

        enum Source {
            Datagram,
            PipeMessage,
            Stream,
            Other,
        }

        let source = {
            let slot = self.endpoints.get(ix);

            match &slot.transport {
                Transport::Udp(_) => Source::Datagram,
                Transport::Unix(_) if slot.path.is_some() => Source::PipeMessage,
                Transport::Tcp(_) | Transport::Unix(_) => Source::Stream,
                _ => Source::Other,
            }
        };

        match source {
            Source::Datagram => self.read_datagrams(ix),
            Source::PipeMessage => self.read_pipe_message(ix),
            Source::Stream => self.read_stream(ix),
            Source::Other => {}
        }
    }

    /// One receive per readiness event; level-triggered polling re-arms the
    /// rest.
    fn read_stream(&mut self, ix: usize) {
        let result = {
            let slot = self.endpoints.get_mut(ix);
            let total = slot.in_total;

            match &mut slot.transport {
                Transport::Tcp(stream) => stream.read(&mut slot.in_buf[total..]),
                Transport::Unix(stream) => stream.read(&mut slot.in_buf[total..]),
                _ => return,
            }
        };

        match result {
            Ok(0) => {
                trace!("endpoint {}: zero byte read - disconnect", ix);
                self.stream_closed(ix);
            }
            Ok(n) => self.handle_read_data(ix, n, None),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                trace!("endpoint {}: socket not ready", ix);
            }
            Err(e) => {
                debug!("endpoint {}: failed to read: {}", ix, e);
                self.stream_closed(ix);
            }
        }
    }

    fn read_datagrams(&mut self, ix: usize) {
        let mut reads_remaining = READS_PER_EVENT;

        loop {
            if self.endpoints.get(ix).in_total == BUF_SIZE {
                break;
            }

            let result = {
                let slot = self.endpoints.get_mut(ix);
                let total = slot.in_total;

                match &slot.transport {
                    Transport::Udp(socket) => socket.recv_from(&mut slot.in_buf[total..]),
                    _ => return,
                }
            };

            match result {
                Ok((n, src)) => {
                    self.endpoints.get_mut(ix).peer_addr = crate::sock::as_v4(src);

                    if n == 0 {
                        trace!("endpoint {}: empty datagram", ix);
                        break;
                    }

                    self.handle_read_data(ix, n, Some(&mut reads_remaining));

                    if self.endpoints.state_of(ix) == Lifecycle::Free || reads_remaining <= 0 {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("endpoint {}: failed to read datagram: {}", ix, e);
                    break;
                }
            }
        }
    }

    /// Appends `n` freshly read bytes, reports them, and applies the
    /// full-buffer policy.
    pub(crate) fn handle_read_data(&mut self, ix: usize, n: usize, reads_remaining: Option<&mut i32>) {
        let paused = {
            let slot = self.endpoints.get_mut(ix);
            slot.in_total += n;
            slot.paused
        };

        if !paused {
            trace!("endpoint {}: passing read event up ({} new bytes)", ix, n);
            let read = self.endpoints.get(ix).events.read.clone();
            read(self, EndpointId(ix), n);

            if let Some(reads) = reads_remaining {
                *reads -= 1;
            }
        }

        // The callback may have closed (and even reallocated) the slot.
        if self.endpoints.state_of(ix) != Lifecycle::Free {
            self.apply_full_buffer_policy(ix);
        }
    }

    /// When the buffer is full: make room if anything was consumed,
    /// otherwise stop reading until the consumer catches up.
    pub(crate) fn apply_full_buffer_policy(&mut self, ix: usize) {
        let slot = self.endpoints.get_mut(ix);

        if slot.in_total < BUF_SIZE {
            return;
        }

        if slot.in_consumed > 0 {
            trace!("endpoint {}: shuffling the buffer to make room", ix);
            let consumed = slot.in_consumed;
            let total = slot.in_total;
            slot.in_buf.copy_within(consumed..total, 0);
            slot.in_total -= consumed;
            slot.in_consumed = 0;
        } else {
            self.stop_reading(ix);
        }
    }

    pub(crate) fn stop_reading(&mut self, ix: usize) {
        if self.endpoints.get(ix).ssl_session.is_some() {
            self.ssl_stop_gate(ix);
            return;
        }

        trace!("endpoint {}: buffer full; read events off", ix);
        self.unwatch(ix);
        self.endpoints.get_mut(ix).read_stopped = true;
    }

    fn restart_reading(&mut self, ix: usize) {
        if self.endpoints.get(ix).ssl_session.is_some() {
            self.ssl_resume_gate(ix, false);
            return;
        }

        if self.endpoints.get(ix).read_stopped {
            trace!("endpoint {}: buffer drained; read events back on", ix);
            self.endpoints.get_mut(ix).read_stopped = false;
            let _ = self.watch(ix, Ready::readable(), IoRole::Read);
        }
    }

    // ---- public buffer operations ---------------------------------------

    /// Discards everything buffered and restarts read events if the full
    /// buffer had stopped them.
    pub fn buf_clear(&mut self, id: EndpointId) {
        {
            let slot = self.endpoints.get_mut(id.0);
            slot.in_total = 0;
            slot.in_consumed = 0;
        }

        self.restart_reading(id.0);
    }

    /// Consumes `count` buffered bytes.
    ///
    /// Consuming pauses the endpoint: no further read events fire until
    /// [`Runtime::buf_resume`]. Consuming the whole buffer clears it.
    pub fn buf_consume(&mut self, id: EndpointId, count: usize) -> Result<()> {
        {
            let slot = self.endpoints.get_mut(id.0);
            let used = slot.in_total - slot.in_consumed;

            if count > used {
                warn!(
                    "endpoint {}: consuming {} bytes but only {} are buffered",
                    id, count, used
                );
                debug_assert!(false, "consume beyond buffered data");
                return Err(Error::Internal);
            }

            slot.in_consumed += count;
            slot.paused = true;
        }

        let slot = self.endpoints.get(id.0);

        if slot.in_consumed == slot.in_total && slot.in_consumed > 0 {
            trace!("endpoint {}: consumed the whole buffer; clearing", id);
            self.buf_clear(id);
        }

        Ok(())
    }

    /// Stops delivering read events; bytes keep accumulating in the buffer.
    pub fn pause(&mut self, id: EndpointId) {
        self.endpoints.get_mut(id.0).paused = true;
    }

    /// Resumes read events after a consume or pause.
    ///
    /// With [`ResumeMode::Immediate`], a synthetic read event for the bytes
    /// already buffered is delivered on the next loop iteration — never from
    /// inside the current callback stack.
    pub fn buf_resume(&mut self, id: EndpointId, mode: ResumeMode) {
        let ix = id.0;

        {
            let slot = self.endpoints.get_mut(ix);
            slot.paused = false;

            // A full buffer with a partial consume needs room before the
            // peer can make progress again.
            if slot.in_total == BUF_SIZE && slot.in_consumed > 0 {
                let consumed = slot.in_consumed;
                let total = slot.in_total;
                slot.in_buf.copy_within(consumed..total, 0);
                slot.in_total -= consumed;
                slot.in_consumed = 0;
            }
        }

        let used = self.buf_used(id);
        let immediate = mode == ResumeMode::Immediate && used != 0;

        if self.endpoints.get(ix).ssl_session.is_some() {
            self.ssl_resume_gate(ix, immediate);
            return;
        }

        if self.endpoints.get(ix).read_stopped {
            self.endpoints.get_mut(ix).read_stopped = false;
            let _ = self.watch(ix, Ready::readable(), IoRole::Read);
        }

        if immediate {
            self.defer(ix, DeferredEvent::ResumeRead);
        } else if mode == ResumeMode::Immediate {
            trace!("endpoint {}: ignoring immediate resume of an empty buffer", id);
        }
    }
}
