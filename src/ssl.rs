//! TLS termination, layered beneath the plain read/write pipelines.
//!
//! Enabling TLS on a stream endpoint routes its socket into an `SslStream`
//! held by a session slot; from then on every byte crosses the OpenSSL
//! engine, and `WANT_READ`/`WANT_WRITE` from the engine steer the endpoint's
//! watcher. The session's state names what the engine is waiting to finish:
//! the handshake (`Connected`), a read, a write, or the close handshake.
//!
//! Certificate verification is recorded, never enforced: a failed
//! verification completes the handshake and is reported through
//! [`Runtime::ssl_info`] for the caller to act on.

use std::fs;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use axon_pool::{Pool, PoolState};
use log::{debug, error, trace, warn};
use mio::net::TcpStream;
use mio::Ready;
use openssl::nid::Nid;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslFiletype, SslMethod, SslMode, SslStream, SslVerifyMode,
};
use openssl::x509::{X509, X509NameRef, X509VerifyResult};

use crate::endpoint::{DeferredEvent, EndpointId, IoRole, Lifecycle, Transport, BUF_SIZE};
use crate::error::{Error, Result, SendStatus};
use crate::runtime::Runtime;
use crate::send::WriteStep;

/// What the TLS engine is waiting on for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SslState {
    Free,
    /// Handshake in flight.
    Connected,
    Established,
    /// `SSL_read` returned a want; retry when the watcher fires.
    Reading,
    /// `SSL_write` (or the handshake inside it) returned a want.
    Writing,
    /// `SSL_shutdown` returned a want; physical close follows.
    Closing,
}

impl PoolState for SslState {
    const COUNT: usize = 6;

    fn from_index(index: usize) -> Self {
        match index {
            0 => SslState::Free,
            1 => SslState::Connected,
            2 => SslState::Established,
            3 => SslState::Reading,
            4 => SslState::Writing,
            5 => SslState::Closing,
            _ => unreachable!("no such ssl state"),
        }
    }

    fn into_index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SslRole {
    Client,
    Server,
}

pub(crate) struct SslSession {
    stream: Option<SslStream<TcpStream>>,
    role: SslRole,
    verified: bool,
    cipher: String,
    bits: i32,
    version: String,
    peer_cert: Option<X509>,
    /// Read gate: while set, nothing is drained from the engine even if the
    /// socket is readable, so a paused consumer also pauses decryption.
    stopped: bool,
}

impl SslSession {
    fn empty() -> Self {
        SslSession {
            stream: None,
            role: SslRole::Server,
            verified: false,
            cipher: String::new(),
            bits: 0,
            version: String::new(),
            peer_cert: None,
            stopped: false,
        }
    }

    fn clear(&mut self) {
        self.stream = None;
        self.verified = false;
        self.cipher.clear();
        self.bits = 0;
        self.version.clear();
        self.peer_cert = None;
        self.stopped = false;
    }
}

pub(crate) struct SslEngine {
    ctx: Option<SslContext>,
    pub(crate) sessions: Pool<SslSession, SslState>,
}

impl SslEngine {
    pub(crate) fn new(session_count: usize) -> Self {
        SslEngine {
            ctx: None,
            sessions: Pool::new(
                "ssl-sessions",
                (0..session_count).map(|_| SslSession::empty()).collect(),
            ),
        }
    }
}

/// Negotiated-session facts, queryable once the handshake completes.
#[derive(Debug, Clone)]
pub struct SslInfo {
    /// Whether the peer certificate chain verified. Informational only.
    pub verified: bool,
    pub cipher: String,
    pub bits: i32,
    pub version: String,
}

impl Runtime {
    /// Configures the TLS context used by every session: certificate chain,
    /// private key, and optional verification roots (a PEM bundle and/or a
    /// directory of PEM files).
    pub fn ssl_init(
        &mut self,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
        ca_file: Option<&Path>,
        ca_dir: Option<&Path>,
    ) -> Result<()> {
        let mut builder = SslContext::builder(SslMethod::tls()).map_err(|e| {
            error!("cannot create TLS context: {}", e);
            Error::Internal
        })?;

        builder
            .set_certificate_chain_file(cert.as_ref())
            .and_then(|_| builder.set_private_key_file(key.as_ref(), SslFiletype::PEM))
            .and_then(|_| builder.check_private_key())
            .map_err(|e| {
                error!("cannot load TLS certificate or key: {}", e);
                Error::Internal
            })?;

        if let Some(ca_file) = ca_file {
            builder.set_ca_file(ca_file).map_err(|e| {
                error!("cannot load CA file {:?}: {}", ca_file, e);
                Error::Internal
            })?;
        }

        if let Some(ca_dir) = ca_dir {
            let entries = fs::read_dir(ca_dir).map_err(|e| {
                error!("cannot read CA directory {:?}: {}", ca_dir, e);
                Error::Internal
            })?;

            for entry in entries.flatten() {
                let pem = match fs::read(entry.path()) {
                    Ok(pem) => pem,
                    Err(_) => continue,
                };

                match X509::from_pem(&pem) {
                    Ok(cert) => {
                        builder.cert_store_mut().add_cert(cert).map_err(|e| {
                            error!("cannot add CA {:?}: {}", entry.path(), e);
                            Error::Internal
                        })?;
                    }
                    Err(_) => debug!("skipping non-certificate file {:?}", entry.path()),
                }
            }
        }

        // Partial writes let a blocked send resume buffer-by-buffer; the
        // moving-buffer mode is required because queued data may shift
        // between attempts.
        builder.set_mode(
            SslMode::ENABLE_PARTIAL_WRITE
                | SslMode::ACCEPT_MOVING_WRITE_BUFFER
                | SslMode::RELEASE_BUFFERS,
        );

        // Request and record verification without ever failing the
        // handshake over it.
        builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

        self.ssl.ctx = Some(builder.build());
        debug!("TLS context initialized");
        Ok(())
    }

    /// Marks a stream endpoint as TLS. Listeners pass the flag to accepted
    /// connections; clients handshake when their connect completes.
    pub fn ssl_enable(&mut self, id: EndpointId) -> Result<()> {
        if self.ssl.ctx.is_none() {
            warn!("ssl_enable before ssl_init");
            return Err(Error::Internal);
        }

        if self.ssl.sessions.is_empty() {
            warn!("ssl_enable with no TLS sessions; size the pool with Builder::ssl_sessions");
            return Err(Error::Internal);
        }

        let slot = self.used_slot(id)?;

        if !slot.is_stream {
            warn!("endpoint {}: TLS on a non-stream endpoint", id);
            return Err(Error::Internal);
        }

        self.endpoints.get_mut(id.0).ssl_enabled = true;
        Ok(())
    }

    /// Negotiated-session facts for an endpoint with a live TLS session.
    pub fn ssl_info(&self, id: EndpointId) -> Result<SslInfo> {
        let session = self.session_of(id.0)?;

        Ok(SslInfo {
            verified: session.verified,
            cipher: session.cipher.clone(),
            bits: session.bits,
            version: session.version.clone(),
        })
    }

    /// The peer certificate's common name, if a certificate was presented.
    pub fn ssl_peer_common_name(&self, id: EndpointId) -> Result<Option<String>> {
        let session = self.session_of(id.0)?;

        Ok(session
            .peer_cert
            .as_ref()
            .and_then(|cert| name_entry(cert.subject_name(), Nid::COMMONNAME)))
    }

    /// The common name of the peer certificate's issuer.
    pub fn ssl_peer_issuer(&self, id: EndpointId) -> Result<Option<String>> {
        let session = self.session_of(id.0)?;

        Ok(session
            .peer_cert
            .as_ref()
            .and_then(|cert| name_entry(cert.issuer_name(), Nid::COMMONNAME)))
    }

    // ---- wiring ----------------------------------------------------------

    pub(crate) fn ssl_start_server(&mut self, ix: usize) {
        self.ssl_start(ix, SslRole::Server)
    }

    pub(crate) fn ssl_start_client(&mut self, ix: usize) {
        self.ssl_start(ix, SslRole::Client)
    }

    /// Moves the endpoint's socket into a fresh session slot and starts the
    /// handshake.
    fn ssl_start(&mut self, ix: usize, role: SslRole) {
        let six = match self
            .ssl
            .sessions
            .set_oldest_state(SslState::Free, SslState::Connected)
        {
            Some(six) => six,
            None => {
                warn!(
                    "endpoint {}: out of TLS sessions; TLS concurrency too high",
                    ix
                );
                self.stream_closed(ix);
                return;
            }
        };

        let stream = {
            let slot = self.endpoints.get_mut(ix);

            match std::mem::replace(&mut slot.transport, Transport::Ssl) {
                Transport::Tcp(stream) => stream,
                other => {
                    slot.transport = other;
                    error!("endpoint {}: TLS on a non-TCP transport", ix);
                    self.ssl.sessions.set_state(six, SslState::Connected, SslState::Free);
                    return;
                }
            }
        };

        let ssl_stream = {
            let ctx = self.ssl.ctx.as_ref().expect("ssl_enable checked the context");

            Ssl::new(ctx).and_then(|mut ssl| {
                match role {
                    SslRole::Client => ssl.set_connect_state(),
                    SslRole::Server => ssl.set_accept_state(),
                }

                SslStream::new(ssl, stream)
            })
        };

        let ssl_stream = match ssl_stream {
            Ok(ssl_stream) => ssl_stream,
            Err(e) => {
                error!("endpoint {}: cannot create TLS session: {}", ix, e);
                self.ssl.sessions.set_state(six, SslState::Connected, SslState::Free);
                self.stream_closed(ix);
                return;
            }
        };

        {
            let session = self.ssl.sessions.get_mut(six);
            session.clear();
            session.stream = Some(ssl_stream);
            session.role = role;
        }

        self.endpoints.get_mut(ix).ssl_session = Some(six);
        trace!("endpoint {}: TLS {:?} handshake starting", ix, role);
        self.ssl_handshake(ix);
    }

    fn ssl_handshake(&mut self, ix: usize) {
        let six = match self.endpoints.get(ix).ssl_session {
            Some(six) => six,
            None => return,
        };

        let result = self
            .ssl
            .sessions
            .get_mut(six)
            .stream
            .as_mut()
            .expect("session has a stream")
            .do_handshake();

        match result {
            Ok(()) => {
                self.ssl.sessions.set_state(six, SslState::Connected, SslState::Established);
                self.ssl_record_session_facts(six);

                if self.watch(ix, Ready::readable(), IoRole::Ssl).is_err() {
                    self.stream_closed(ix);
                    return;
                }

                let role = self.ssl.sessions.get(six).role;
                debug!("endpoint {}: TLS {:?} connection established", ix, role);
                let connected = self.endpoints.get(ix).events.connected.clone();

                if let Some(connected) = connected {
                    connected(self, EndpointId(ix));
                }
            }
            Err(e) => {
                let _ = self.ssl_handle_error(
                    ix,
                    six,
                    e,
                    SslState::Connected,
                    SslState::Connected,
                    SslState::Connected,
                    "handshake",
                );
            }
        }
    }

    fn ssl_record_session_facts(&mut self, six: usize) {
        let (verified, peer_cert, cipher, bits, version) = {
            let session = self.ssl.sessions.get(six);
            let ssl = session.stream.as_ref().expect("session has a stream").ssl();

            let (cipher, bits) = match ssl.current_cipher() {
                Some(cipher) => (cipher.name().to_string(), cipher.bits().secret),
                None => (String::new(), 0),
            };

            (
                ssl.verify_result() == X509VerifyResult::OK,
                ssl.peer_certificate(),
                cipher,
                bits,
                ssl.version_str().to_string(),
            )
        };

        let session = self.ssl.sessions.get_mut(six);
        session.verified = verified;
        session.peer_cert = peer_cert;
        session.cipher = cipher;
        session.bits = bits;
        session.version = version;
    }

    // ---- readiness -------------------------------------------------------

    /// Readiness on a TLS endpoint: what to do depends on what the engine
    /// said it was waiting for.
    pub(crate) fn ssl_on_ready(&mut self, ix: usize) {
        let six = match self.endpoints.get(ix).ssl_session {
            Some(six) => six,
            None => return,
        };

        match self.ssl.sessions.state_of(six) {
            SslState::Free => {}
            SslState::Connected => self.ssl_handshake(ix),
            SslState::Established | SslState::Reading => self.ssl_read_drain(ix),
            SslState::Writing => self.on_drain_ready(ix),
            SslState::Closing => {
                let _ = self.ssl_close_endpoint(ix);
            }
        }
    }

    /// Pulls plaintext out of the engine until it wants the network, the
    /// buffer fills, or the consumer pauses the gate.
    fn ssl_read_drain(&mut self, ix: usize) {
        loop {
            if self.endpoints.state_of(ix) == Lifecycle::Free {
                return;
            }

            let six = match self.endpoints.get(ix).ssl_session {
                Some(six) => six,
                None => return,
            };

            if self.ssl.sessions.get(six).stopped
                || self.endpoints.get(ix).in_total == BUF_SIZE
            {
                return;
            }

            let result = {
                let slot = self.endpoints.get_mut(ix);
                let total = slot.in_total;
                let session = self.ssl.sessions.get_mut(six);

                session
                    .stream
                    .as_mut()
                    .expect("session has a stream")
                    .ssl_read(&mut slot.in_buf[total..])
            };

            match result {
                Ok(0) => return,
                Ok(n) => self.handle_read_data(ix, n, None),
                Err(e) => {
                    let state = self.ssl.sessions.state_of(six);
                    let _ = self.ssl_handle_error(
                        ix,
                        six,
                        e,
                        state,
                        SslState::Established,
                        SslState::Reading,
                        "read",
                    );
                    return;
                }
            }
        }
    }

    /// Fills the input buffer from plaintext the engine already holds,
    /// without delivering callbacks. Used by resume-immediate so the
    /// synthetic read event covers everything available.
    pub(crate) fn ssl_fill_from_engine(&mut self, ix: usize) {
        loop {
            if self.endpoints.state_of(ix) == Lifecycle::Free {
                return;
            }

            let six = match self.endpoints.get(ix).ssl_session {
                Some(six) => six,
                None => return,
            };

            if self.ssl.sessions.get(six).stopped
                || self.endpoints.get(ix).in_total == BUF_SIZE
            {
                return;
            }

            let result = {
                let slot = self.endpoints.get_mut(ix);
                let total = slot.in_total;
                let session = self.ssl.sessions.get_mut(six);

                session
                    .stream
                    .as_mut()
                    .expect("session has a stream")
                    .ssl_read(&mut slot.in_buf[total..])
            };

            match result {
                Ok(0) => return,
                Ok(n) => {
                    self.endpoints.get_mut(ix).in_total += n;
                }
                Err(e) => {
                    let state = self.ssl.sessions.state_of(six);
                    let _ = self.ssl_handle_error(
                        ix,
                        six,
                        e,
                        state,
                        SslState::Established,
                        SslState::Reading,
                        "read",
                    );
                    return;
                }
            }
        }
    }

    /// Deferred drain after a resume: deliver whatever the engine has.
    pub(crate) fn ssl_drain_engine(&mut self, ix: usize) {
        if self.endpoints.state_of(ix) == Lifecycle::Free {
            return;
        }

        if self.endpoints.get(ix).ssl_session.is_some() {
            self.ssl_read_drain(ix);
        }
    }

    /// One `SSL_write` attempt for the generic send pipeline.
    pub(crate) fn ssl_write_step(&mut self, ix: usize, data: &[u8]) -> WriteStep {
        let six = match self.endpoints.get(ix).ssl_session {
            Some(six) => six,
            None => return WriteStep::Failed(Error::NoConnection),
        };

        let result = self
            .ssl
            .sessions
            .get_mut(six)
            .stream
            .as_mut()
            .expect("session has a stream")
            .ssl_write(data);

        match result {
            Ok(n) => WriteStep::Wrote(n),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => {
                    self.ssl_enter_state(six, SslState::Writing);
                    let _ = self.watch(ix, Ready::readable(), IoRole::Ssl);
                    WriteStep::Blocked
                }
                ErrorCode::WANT_WRITE => {
                    self.ssl_enter_state(six, SslState::Writing);
                    let _ = self.watch(ix, Ready::writable(), IoRole::Ssl);
                    WriteStep::Blocked
                }
                _ => {
                    debug!("endpoint {}: SSL_write error: {}", ix, e);
                    WriteStep::Failed(Error::WriteFailed)
                }
            },
        }
    }

    /// After the send list drains on a TLS endpoint: leave `Writing` and go
    /// back to reading.
    pub(crate) fn ssl_rearm_read(&mut self, ix: usize) {
        if let Some(six) = self.endpoints.get(ix).ssl_session {
            if self.ssl.sessions.state_of(six) == SslState::Writing {
                self.ssl
                    .sessions
                    .set_state(six, SslState::Writing, SslState::Established);
            }

            let _ = self.watch(ix, Ready::readable(), IoRole::Ssl);
        }
    }

    // ---- gating and teardown --------------------------------------------

    /// Full buffer on a TLS endpoint: close the decryption gate instead of
    /// the watcher, so handshakes and writes keep moving.
    pub(crate) fn ssl_stop_gate(&mut self, ix: usize) {
        if let Some(six) = self.endpoints.get(ix).ssl_session {
            trace!("endpoint {}: TLS read gate closed", ix);
            self.ssl.sessions.get_mut(six).stopped = true;
        }
    }

    /// Resume on a TLS endpoint: reopen the gate and schedule a drain of
    /// anything the engine buffered while it was closed. With `immediate`,
    /// the buffered bytes are folded into one synthetic read event.
    pub(crate) fn ssl_resume_gate(&mut self, ix: usize, immediate: bool) {
        if let Some(six) = self.endpoints.get(ix).ssl_session {
            trace!("endpoint {}: TLS read gate reopened", ix);
            self.ssl.sessions.get_mut(six).stopped = false;

            let event = if immediate {
                DeferredEvent::ResumeRead
            } else {
                DeferredEvent::SslDrain
            };

            self.defer(ix, event);
        }
    }

    /// User-initiated close: drive the TLS close handshake, finishing the
    /// physical close now or on a later readiness event.
    pub(crate) fn ssl_close_endpoint(&mut self, ix: usize) -> Result<()> {
        let six = match self.endpoints.get(ix).ssl_session {
            Some(six) => six,
            None => {
                self.close_with_failure(ix, Error::NoConnection);
                return Ok(());
            }
        };

        let state = self.ssl.sessions.state_of(six);

        match state {
            SslState::Established | SslState::Closing => {
                let result = self
                    .ssl
                    .sessions
                    .get_mut(six)
                    .stream
                    .as_mut()
                    .expect("session has a stream")
                    .shutdown();

                match result {
                    Ok(_) => {
                        trace!("endpoint {}: TLS shut down", ix);
                        self.close_with_failure(ix, Error::NoConnection);
                    }
                    Err(e) => match e.code() {
                        ErrorCode::WANT_READ => {
                            self.ssl_enter_state(six, SslState::Closing);
                            let _ = self.watch(ix, Ready::readable(), IoRole::Ssl);
                        }
                        ErrorCode::WANT_WRITE => {
                            self.ssl_enter_state(six, SslState::Closing);
                            let _ = self.watch(ix, Ready::writable(), IoRole::Ssl);
                        }
                        _ => {
                            debug!("endpoint {}: SSL_shutdown error: {}", ix, e);
                            self.close_with_failure(ix, Error::NoConnection);
                        }
                    },
                }
            }
            _ => {
                debug!(
                    "endpoint {}: cannot shut down TLS in state {:?}; closing uncleanly",
                    ix, state
                );
                self.close_with_failure(ix, Error::NoConnection);
            }
        }

        Ok(())
    }

    /// Maps an engine want/error to watcher changes or a close, the shared
    /// tail of every engine call.
    fn ssl_handle_error(
        &mut self,
        ix: usize,
        six: usize,
        err: openssl::ssl::Error,
        state: SslState,
        read_state: SslState,
        write_state: SslState,
        op: &str,
    ) -> Result<SendStatus> {
        match err.code() {
            ErrorCode::WANT_READ => {
                trace!("endpoint {}: {} wants to read", ix, op);

                if state != read_state {
                    self.ssl.sessions.set_state(six, state, read_state);
                }

                let _ = self.watch(ix, Ready::readable(), IoRole::Ssl);
                Ok(SendStatus::InProgress)
            }
            ErrorCode::WANT_WRITE => {
                trace!("endpoint {}: {} wants to write", ix, op);

                if state != write_state {
                    self.ssl.sessions.set_state(six, state, write_state);
                }

                let _ = self.watch(ix, Ready::writable(), IoRole::Ssl);
                Ok(SendStatus::InProgress)
            }
            ErrorCode::ZERO_RETURN => {
                debug!("endpoint {}: TLS closed cleanly by peer", ix);
                self.ssl_teardown_report_close(ix);
                Err(Error::EndOfFile)
            }
            _ => {
                debug!("endpoint {}: {} failed: {}", ix, op, err);
                self.ssl_teardown_report_close(ix);
                Err(Error::WriteFailed)
            }
        }
    }

    /// Unclean engine termination: free everything and report a close.
    fn ssl_teardown_report_close(&mut self, ix: usize) {
        let close = self.endpoints.get(ix).events.close.clone();
        self.close_with_failure(ix, Error::NoConnection);

        if let Some(close) = close {
            close(self, EndpointId(ix));
        }
    }

    /// Releases the endpoint's session slot, dropping the engine stream
    /// (which closes the socket). Called from the generic teardown.
    pub(crate) fn ssl_release_session(&mut self, ix: usize) {
        if let Some(six) = self.endpoints.get_mut(ix).ssl_session.take() {
            let state = self.ssl.sessions.state_of(six);
            self.ssl.sessions.get_mut(six).clear();

            if state != SslState::Free {
                self.ssl.sessions.set_state(six, state, SslState::Free);
            }
        }
    }

    pub(crate) fn ssl_endpoint_fd(&self, ix: usize) -> Option<RawFd> {
        let six = self.endpoints.get(ix).ssl_session?;

        self.ssl
            .sessions
            .get(six)
            .stream
            .as_ref()
            .map(|stream| stream.get_ref().as_raw_fd())
    }

    fn ssl_enter_state(&mut self, six: usize, target: SslState) {
        let state = self.ssl.sessions.state_of(six);

        if state != target {
            self.ssl.sessions.set_state(six, state, target);
        }
    }

    fn session_of(&self, ix: usize) -> Result<&SslSession> {
        match self.endpoints.get(ix).ssl_session {
            Some(six) => Ok(self.ssl.sessions.get(six)),
            None => {
                warn!("endpoint {}: not a TLS endpoint", ix);
                Err(Error::Internal)
            }
        }
    }
}

fn name_entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}
