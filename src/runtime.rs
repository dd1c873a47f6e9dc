//! The runtime: a single-threaded readiness loop driving every endpoint.
//!
//! One `Runtime` owns the poll, the endpoint pool, the TLS session pool, the
//! timers, and the deferred-event queue. All callbacks execute on the thread
//! that calls [`Runtime::run`] (or [`Runtime::run_once`]); nothing here is
//! `Send`, and no lock is ever held across a callback.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use axon_pool::Pool;
use log::{debug, error, trace, warn};
use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::endpoint::{DeferredEvent, EndpointId, EndpointSlot, IoRole, Lifecycle};
use crate::error::{Error, Result};
use crate::timer::Timers;

const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 256;

/// Up to this many deferred callbacks run per loop iteration; the rest wait
/// for the next tick so I/O is never starved.
const DEFERRED_PER_TICK: usize = 64;

/// Builds a [`Runtime`].
///
/// The endpoint count is fixed for the life of the runtime: running out of
/// endpoints is reported per-operation as
/// [`Error::NoUnusedElements`](crate::Error::NoUnusedElements) rather than
/// growing the pool.
pub struct Builder {
    endpoints: usize,
    #[cfg(feature = "ssl")]
    ssl_sessions: usize,
    listen_backlog: i32,
}

impl Builder {
    /// Total number of concurrent endpoints (listeners, connections, UDP
    /// ports, pipes) the runtime will hold.
    pub fn endpoints(mut self, count: usize) -> Self {
        self.endpoints = count;
        self
    }

    /// Number of concurrent TLS sessions; defaults to the endpoint count.
    #[cfg(feature = "ssl")]
    pub fn ssl_sessions(mut self, count: usize) -> Self {
        self.ssl_sessions = count;
        self
    }

    /// Backlog for listening sockets.
    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let poll = Poll::new().map_err(|e| {
            error!("cannot create poll: {}", e);
            Error::Internal
        })?;

        let (wake_registration, wake_set) = Registration::new2();
        poll.register(&wake_registration, WAKE_TOKEN, Ready::readable(), PollOpt::level())
            .map_err(|e| {
                error!("cannot register wakeup: {}", e);
                Error::Internal
            })?;

        let slots = (0..self.endpoints).map(|_| EndpointSlot::empty()).collect();

        debug!("runtime ready with {} endpoints", self.endpoints);

        Ok(Runtime {
            poll,
            events: Some(Events::with_capacity(EVENT_CAPACITY)),
            endpoints: Pool::new("endpoints", slots),
            timers: Timers::new(),
            wake_registration,
            wake_set,
            listen_backlog: self.listen_backlog,
            running: false,
            #[cfg(feature = "ssl")]
            ssl: crate::ssl::SslEngine::new(self.ssl_sessions),
        })
    }
}

/// The event-object runtime. See the crate docs for the model.
pub struct Runtime {
    pub(crate) poll: Poll,
    pub(crate) events: Option<Events>,
    pub(crate) endpoints: Pool<EndpointSlot, Lifecycle>,
    pub(crate) timers: Timers,
    // Held so the wakeup registration stays alive as long as the poll.
    #[allow(dead_code)]
    wake_registration: Registration,
    wake_set: SetReadiness,
    pub(crate) listen_backlog: i32,
    running: bool,
    #[cfg(feature = "ssl")]
    pub(crate) ssl: crate::ssl::SslEngine,
}

/// Wakes the runtime loop from another thread or context.
#[derive(Clone)]
pub struct Waker {
    set: SetReadiness,
}

impl Waker {
    /// Forces the loop out of its poll so timers and deferred events run.
    pub fn wake(&self) -> Result<()> {
        self.set.set_readiness(Ready::readable()).map_err(|e| {
            error!("wakeup failed: {}", e);
            Error::Internal
        })
    }
}

impl Runtime {
    pub fn builder() -> Builder {
        Builder {
            endpoints: 64,
            #[cfg(feature = "ssl")]
            ssl_sessions: 0,
            listen_backlog: 128,
        }
    }

    /// A handle other threads can use to interrupt [`Runtime::run`].
    pub fn waker(&self) -> Waker {
        Waker {
            set: self.wake_set.clone(),
        }
    }

    /// Runs the loop until [`Runtime::stop`] is called from a callback.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;

        while self.running {
            self.run_once(None)?;
        }

        Ok(())
    }

    /// Stops [`Runtime::run`] after the current iteration completes.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// One loop iteration: drain deferred events scheduled by the previous
    /// iteration, poll (bounded by `timeout`, the nearest timer, and any
    /// still-pending deferred work), dispatch readiness, then fire due
    /// timers. Returns the number of I/O events dispatched.
    ///
    /// Deferred events run before this iteration's I/O, mirroring a loop
    /// release hook: a callback scheduled "for the next iteration" never
    /// races the poll that follows it.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.drain_deferred();

        let now = Instant::now();
        let mut timeout = timeout;

        if let Some(deadline) = self.timers.next_deadline() {
            let until = deadline.saturating_duration_since(now);
            timeout = Some(timeout.map_or(until, |t| t.min(until)));
        }

        if self.endpoints.count(Lifecycle::Deferred) > 0 {
            timeout = Some(Duration::from_millis(0));
        }

        let mut events = self.events.take().expect("event buffer in use");
        let poll_result = self.poll.poll(&mut events, timeout);

        let mut dispatched = 0;

        if poll_result.is_ok() {
            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {
                        let _ = self.wake_set.set_readiness(Ready::empty());
                    }
                    Token(ix) => {
                        self.dispatch_io(ix);
                        dispatched += 1;
                    }
                }
            }
        }

        self.events = Some(events);

        match poll_result {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("poll failed: {}", e);
                return Err(Error::Internal);
            }
        }

        self.fire_timers();
        Ok(dispatched)
    }

    fn dispatch_io(&mut self, ix: usize) {
        if ix >= self.endpoints.len() {
            return;
        }

        // A stale event for a slot freed earlier in this iteration.
        if self.endpoints.state_of(ix) == Lifecycle::Free {
            trace!("endpoint {}: dropping event for freed endpoint", ix);
            return;
        }

        let role = self.endpoints.get(ix).role;

        match role {
            IoRole::Idle => {}
            IoRole::Accept => self.on_accept_ready(ix),
            IoRole::Connect => self.on_connect_ready(ix),
            IoRole::Read => self.on_read_ready(ix),
            IoRole::Drain => self.on_drain_ready(ix),
            IoRole::NotifyWritable => self.on_notify_ready(ix),
            IoRole::Sendfile => self.on_sendfile_ready(ix),
            IoRole::Ssl => self.ssl_on_ready(ix),
        }
    }

    fn fire_timers(&mut self) {
        loop {
            let cb = match self.timers.pop_due(Instant::now()) {
                Some(cb) => cb,
                None => break,
            };

            cb(self);
        }
    }

    // ---- deferred events -------------------------------------------------

    /// Schedules `event` to run on the next loop iteration. At most one
    /// deferral may be pending per endpoint: re-requesting the same event is
    /// a no-op, a different one is a caller bug.
    pub(crate) fn defer(&mut self, ix: usize, event: DeferredEvent) {
        let pending = self.endpoints.get(ix).deferred;

        match pending {
            None => {
                self.endpoints.get_mut(ix).deferred = Some(event);
                self.endpoints.set_state(ix, Lifecycle::Used, Lifecycle::Deferred);
                trace!("endpoint {}: deferred {:?}", ix, event);
            }
            Some(current) if current == event => {
                trace!("endpoint {}: {:?} already deferred", ix, event);
            }
            Some(current) => {
                debug_assert!(
                    false,
                    "endpoint {}: deferring {:?} while {:?} is pending",
                    ix, event, current
                );
                error!(
                    "endpoint {}: cannot defer {:?} while {:?} is pending",
                    ix, event, current
                );
            }
        }
    }

    fn drain_deferred(&mut self) {
        for _ in 0..DEFERRED_PER_TICK {
            let ix = match self
                .endpoints
                .set_oldest_state(Lifecycle::Deferred, Lifecycle::Used)
            {
                Some(ix) => ix,
                None => break,
            };

            let event = match self.endpoints.get_mut(ix).deferred.take() {
                Some(event) => event,
                None => {
                    error!("endpoint {}: deferred with no event", ix);
                    continue;
                }
            };

            trace!("endpoint {}: delivering deferred {:?}", ix, event);
            self.deliver_deferred(ix, event);
        }
    }

    fn deliver_deferred(&mut self, ix: usize, event: DeferredEvent) {
        match event {
            DeferredEvent::Connected => {
                let connected = self.endpoints.get(ix).events.connected.clone();

                if let Some(connected) = connected {
                    connected(self, EndpointId(ix));
                }
            }
            DeferredEvent::ResumeRead => {
                // For TLS endpoints, plaintext the engine buffered while the
                // consumer was paused belongs in this same synthetic event.
                #[cfg(feature = "ssl")]
                self.ssl_fill_from_engine(ix);

                if self.endpoints.state_of(ix) == Lifecycle::Free {
                    return;
                }

                let (used, paused) = {
                    let slot = self.endpoints.get(ix);
                    (slot.in_total - slot.in_consumed, slot.paused)
                };

                if used > 0 && !paused {
                    let read = self.endpoints.get(ix).events.read.clone();
                    read(self, EndpointId(ix), used);
                }

                if self.endpoints.state_of(ix) != Lifecycle::Free {
                    self.apply_full_buffer_policy(ix);
                }
            }
            DeferredEvent::SslDrain => {
                #[cfg(feature = "ssl")]
                self.ssl_drain_engine(ix);
            }
        }
    }

    // ---- watcher plumbing ------------------------------------------------

    /// Points the endpoint's poll registration at `ready` events, to be
    /// interpreted as `role`.
    pub(crate) fn watch(&mut self, ix: usize, ready: Ready, role: IoRole) -> Result<()> {
        let fd = match self.endpoint_fd(ix) {
            Some(fd) => fd,
            None => {
                warn!("endpoint {}: no socket to watch", ix);
                return Err(Error::Internal);
            }
        };

        let registered = self.endpoints.get(ix).registered;

        let result = if registered.is_some() {
            self.poll
                .reregister(&EventedFd(&fd), Token(ix), ready, PollOpt::level())
        } else {
            self.poll
                .register(&EventedFd(&fd), Token(ix), ready, PollOpt::level())
        };

        if let Err(e) = result {
            error!("endpoint {}: cannot watch fd {}: {}", ix, fd, e);
            return Err(Error::Internal);
        }

        let slot = self.endpoints.get_mut(ix);
        slot.registered = Some(ready);
        slot.role = role;
        Ok(())
    }

    /// Drops the endpoint's poll registration, if any.
    pub(crate) fn unwatch(&mut self, ix: usize) {
        if self.endpoints.get(ix).registered.is_none() {
            return;
        }

        if let Some(fd) = self.endpoint_fd(ix) {
            if let Err(e) = self.poll.deregister(&EventedFd(&fd)) {
                debug!("endpoint {}: deregister failed: {}", ix, e);
            }
        }

        self.endpoints.get_mut(ix).registered = None;
    }

    pub(crate) fn endpoint_fd(&self, ix: usize) -> Option<RawFd> {
        match self.endpoints.get(ix).transport.fd() {
            Some(fd) => Some(fd),
            None => self.ssl_endpoint_fd(ix),
        }
    }
}

// Without the ssl feature an endpoint can never be TLS-enabled, so these are
// never reached; they only satisfy the dispatcher.
#[cfg(not(feature = "ssl"))]
impl Runtime {
    pub(crate) fn ssl_endpoint_fd(&self, _ix: usize) -> Option<RawFd> {
        None
    }

    pub(crate) fn ssl_start_server(&mut self, _ix: usize) {}

    pub(crate) fn ssl_start_client(&mut self, _ix: usize) {}

    pub(crate) fn ssl_on_ready(&mut self, _ix: usize) {}

    pub(crate) fn ssl_close_endpoint(&mut self, ix: usize) -> Result<()> {
        self.close_with_failure(ix, Error::NoConnection);
        Ok(())
    }

    pub(crate) fn ssl_stop_gate(&mut self, _ix: usize) {}

    pub(crate) fn ssl_resume_gate(&mut self, _ix: usize, _immediate: bool) {}
}
