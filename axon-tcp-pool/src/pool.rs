use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::Child;
use std::rc::Rc;
use std::time::{Duration, Instant};

use axon::{EndpointEvents, EndpointId, Error, Result, Runtime, SendStatus, TimerId};
use axon_pool::{Pool, PoolState};
use log::{debug, info, trace, warn};

/// A node is retired once it has failed this many times in a row.
const MAX_FAILURES: u32 = 2;

/// At most this many connects are initiated per ramp pass.
const CONNECTION_RAMP: usize = 10;

/// Per-node connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unconnected,
    Connecting,
    /// Connected, waiting for the caller to finish protocol setup.
    Initializing,
    /// Idle and writable.
    ReadyToSend,
    /// A request is in flight.
    InUse,
}

impl PoolState for NodeState {
    const COUNT: usize = 5;

    fn from_index(index: usize) -> Self {
        match index {
            0 => NodeState::Unconnected,
            1 => NodeState::Connecting,
            2 => NodeState::Initializing,
            3 => NodeState::ReadyToSend,
            4 => NodeState::InUse,
            _ => unreachable!("no such node state"),
        }
    }

    fn into_index(self) -> usize {
        self as usize
    }
}

pub type PoolFn = Rc<dyn Fn(&mut Runtime, TcpPool)>;
pub type PoolConnectedFn = Rc<dyn Fn(&mut Runtime, TcpPool, EndpointId)>;
pub type PoolReadFn = Rc<dyn Fn(&mut Runtime, TcpPool, EndpointId, usize)>;
pub type PoolCloseFn = Rc<dyn Fn(&mut Runtime, TcpPool, EndpointId)>;

/// The pool's callback bundle. `ready_to_write` and `read` are required;
/// the rest are optional.
#[derive(Clone)]
pub struct PoolEvents {
    pub(crate) ready_to_write: PoolFn,
    pub(crate) connected: Option<PoolConnectedFn>,
    pub(crate) read: PoolReadFn,
    pub(crate) close: Option<PoolCloseFn>,
    pub(crate) timeout: Option<PoolFn>,
}

impl PoolEvents {
    pub fn new(
        ready_to_write: impl Fn(&mut Runtime, TcpPool) + 'static,
        read: impl Fn(&mut Runtime, TcpPool, EndpointId, usize) + 'static,
    ) -> Self {
        PoolEvents {
            ready_to_write: Rc::new(ready_to_write),
            connected: None,
            read: Rc::new(read),
            close: None,
            timeout: None,
        }
    }

    pub fn on_connected(
        mut self,
        connected: impl Fn(&mut Runtime, TcpPool, EndpointId) + 'static,
    ) -> Self {
        self.connected = Some(Rc::new(connected));
        self
    }

    pub fn on_close(mut self, close: impl Fn(&mut Runtime, TcpPool, EndpointId) + 'static) -> Self {
        self.close = Some(Rc::new(close));
        self
    }

    pub fn on_timeout(mut self, timeout: impl Fn(&mut Runtime, TcpPool) + 'static) -> Self {
        self.timeout = Some(Rc::new(timeout));
        self
    }
}

/// The pool's supervision timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolTimeouts {
    /// How long a node may sit in `Initializing` before the timeout fires.
    pub initialization: Option<Duration>,
    /// How long a node may sit in `InUse` awaiting its reply.
    pub response: Option<Duration>,
}

#[derive(Clone)]
enum Target {
    Connect(SocketAddrV4),
    Spawn { program: String, args: Vec<String> },
}

struct Node {
    endpoint: Option<EndpointId>,
    user_data: Option<Box<dyn Any>>,
    failures: u32,
    child: Option<Child>,
    prev_child: Option<Child>,
}

impl Node {
    fn new() -> Self {
        Node {
            endpoint: None,
            user_data: None,
            failures: 0,
            child: None,
            prev_child: None,
        }
    }
}

struct Inner {
    name: String,
    target: Target,
    nodes: Pool<Node, NodeState>,
    queued_writes: usize,
    events: PoolEvents,
    has_initialization: bool,
    node_of: HashMap<usize, usize>,
    timer: Option<TimerId>,
}

/// A fixed-size pool of outbound connections (or spawned children), handed
/// out least-recently-used first.
///
/// The handle is cheap to clone; callbacks receive their own clone.
#[derive(Clone)]
pub struct TcpPool {
    inner: Rc<RefCell<Inner>>,
}

impl TcpPool {
    /// A pool of `concurrency` TCP connections to `peer`, ramping
    /// immediately.
    pub fn connect(
        rt: &mut Runtime,
        name: impl Into<String>,
        concurrency: usize,
        peer: SocketAddrV4,
        events: PoolEvents,
        timeouts: PoolTimeouts,
    ) -> Result<TcpPool> {
        Self::new_internal(rt, name, concurrency, Target::Connect(peer), events, timeouts)
    }

    /// A pool of `concurrency` spawned `program` children, each on the far
    /// end of a socketpair.
    pub fn spawn(
        rt: &mut Runtime,
        name: impl Into<String>,
        concurrency: usize,
        program: impl Into<String>,
        args: Vec<String>,
        events: PoolEvents,
        timeouts: PoolTimeouts,
    ) -> Result<TcpPool> {
        let target = Target::Spawn {
            program: program.into(),
            args,
        };
        Self::new_internal(rt, name, concurrency, target, events, timeouts)
    }

    fn new_internal(
        rt: &mut Runtime,
        name: impl Into<String>,
        concurrency: usize,
        target: Target,
        events: PoolEvents,
        timeouts: PoolTimeouts,
    ) -> Result<TcpPool> {
        let name = name.into();

        let state_timeouts = vec![
            None,
            None,
            timeouts.initialization,
            None,
            timeouts.response,
        ];

        let nodes = Pool::with_timeouts(
            name.clone(),
            (0..concurrency).map(|_| Node::new()).collect(),
            state_timeouts,
        );

        let pool = TcpPool {
            inner: Rc::new(RefCell::new(Inner {
                name,
                target,
                nodes,
                queued_writes: 0,
                events,
                has_initialization: timeouts.initialization.is_some(),
                node_of: HashMap::new(),
                timer: None,
            })),
        };

        let supervision = [timeouts.initialization, timeouts.response]
            .iter()
            .flatten()
            .min()
            .copied();

        if let Some(shortest) = supervision {
            let interval = (shortest / 4)
                .max(Duration::from_millis(10))
                .min(Duration::from_secs(1));
            let timer_pool = pool.clone();
            let timer = rt.add_repeating(interval, move |rt| timer_pool.check_timeouts(rt));
            pool.inner.borrow_mut().timer = Some(timer);
        }

        debug!(
            "tcp pool {}: created with concurrency {}",
            pool.name(),
            concurrency
        );
        pool.ramp(rt);
        Ok(pool)
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Number of nodes currently in `state`.
    pub fn count(&self, state: NodeState) -> usize {
        self.inner.borrow().nodes.count(state)
    }

    /// The state of the node owning this endpoint, if it belongs to the
    /// pool.
    pub fn node_state(&self, id: EndpointId) -> Option<NodeState> {
        let inner = self.inner.borrow();
        let item = *inner.node_of.get(&id.index())?;
        Some(inner.nodes.state_of(item))
    }

    /// The failure count of the node owning this endpoint.
    pub fn node_failures(&self, id: EndpointId) -> Option<u32> {
        let inner = self.inner.borrow();
        let item = *inner.node_of.get(&id.index())?;
        Some(inner.nodes.get(item).failures)
    }

    /// Fires the ready-to-write callback now if a connection is idle, or
    /// queues it for the moment one becomes idle.
    pub fn queue_ready_to_write(&self, rt: &mut Runtime) {
        let cb = {
            let mut inner = self.inner.borrow_mut();

            if inner.nodes.count(NodeState::ReadyToSend) == 0 {
                trace!("tcp pool {}: no connection ready; queueing writer", inner.name);
                inner.queued_writes += 1;
                None
            } else {
                Some(inner.events.ready_to_write.clone())
            }
        };

        if let Some(cb) = cb {
            cb(rt, self.clone());
        }
    }

    /// Withdraws one queued ready-to-write request.
    pub fn unqueue_ready_to_write(&self) {
        let mut inner = self.inner.borrow_mut();

        if inner.queued_writes == 0 {
            warn!("tcp pool {}: unqueue with no queued writers", inner.name);
            return;
        }

        inner.queued_writes -= 1;
    }

    /// Takes the least recently used idle connection, marks it in-use,
    /// attaches `user_data` to it, and writes `data`.
    pub fn write(
        &self,
        rt: &mut Runtime,
        data: &[u8],
        user_data: Option<Box<dyn Any>>,
    ) -> Result<SendStatus> {
        let id = {
            let mut inner = self.inner.borrow_mut();

            let item = inner
                .nodes
                .set_oldest_state(NodeState::ReadyToSend, NodeState::InUse)
                .ok_or_else(|| {
                    warn!("tcp pool {}: no connections ready to send", inner.name);
                    Error::NoConnection
                })?;

            let node = inner.nodes.get_mut(item);
            node.user_data = user_data;
            node.endpoint.ok_or(Error::Internal)?
        };

        rt.write(id, data)
    }

    /// Reports that protocol initialization on this connection is complete;
    /// the node becomes ready to send.
    pub fn initialized(&self, rt: &mut Runtime, id: EndpointId) {
        let item = {
            let inner = self.inner.borrow();

            match inner.node_of.get(&id.index()).copied() {
                Some(item) => item,
                None => {
                    warn!("tcp pool {}: initialized() for unknown endpoint {}", inner.name, id);
                    return;
                }
            }
        };

        self.inner.borrow_mut().nodes.set_state(
            item,
            NodeState::Initializing,
            NodeState::ReadyToSend,
        );
        self.restart(rt);
    }

    /// The user data attached to this endpoint's node by
    /// [`TcpPool::write`].
    pub fn take_node_user_data(&self, id: EndpointId) -> Option<Box<dyn Any>> {
        let mut inner = self.inner.borrow_mut();
        let item = *inner.node_of.get(&id.index())?;
        inner.nodes.get_mut(item).user_data.take()
    }

    pub fn set_node_user_data(&self, id: EndpointId, data: Box<dyn Any>) {
        let mut inner = self.inner.borrow_mut();

        if let Some(item) = inner.node_of.get(&id.index()).copied() {
            inner.nodes.get_mut(item).user_data = Some(data);
        }
    }

    /// Closes every connection and cancels supervision. Nodes are not
    /// re-ramped afterwards.
    pub fn shutdown(&self, rt: &mut Runtime) {
        let (timer, endpoints) = {
            let mut inner = self.inner.borrow_mut();
            let timer = inner.timer.take();
            let mut endpoints = Vec::new();

            for state in [
                NodeState::Connecting,
                NodeState::Initializing,
                NodeState::ReadyToSend,
                NodeState::InUse,
            ]
            .iter()
            {
                while let Some(item) = inner.nodes.set_oldest_state(*state, NodeState::Unconnected)
                {
                    let node = inner.nodes.get_mut(item);
                    // Keep the retired flag so shutdown nodes never re-ramp.
                    node.failures = MAX_FAILURES;

                    if let Some(id) = node.endpoint.take() {
                        endpoints.push(id);
                    }
                }
            }

            inner.node_of.clear();
            (timer, endpoints)
        };

        if let Some(timer) = timer {
            rt.cancel_timer(timer);
        }

        for id in endpoints {
            let _ = rt.close(id);
        }

        debug!("tcp pool {}: shut down", self.name());
    }

    // ---- the ramp --------------------------------------------------------

    /// Initiates connects (or spawns) for unconnected nodes, a bounded
    /// number per call. Nodes that have failed too often are skipped and
    /// demoted to the back of the line.
    pub fn ramp(&self, rt: &mut Runtime) {
        enum Step {
            Done,
            Skip,
            Start(usize),
        }

        for _ in 0..CONNECTION_RAMP {
            let step = {
                let mut inner = self.inner.borrow_mut();

                match inner.nodes.oldest_index(NodeState::Unconnected) {
                    None => Step::Done,
                    Some(item) => {
                        if inner.nodes.get(item).failures >= MAX_FAILURES {
                            trace!(
                                "tcp pool {}: node {} has failed {} times; skipping it",
                                inner.name,
                                item,
                                inner.nodes.get(item).failures
                            );
                            inner.nodes.touch(item);
                            Step::Skip
                        } else {
                            inner.nodes.set_state(
                                item,
                                NodeState::Unconnected,
                                NodeState::Connecting,
                            );
                            Step::Start(item)
                        }
                    }
                }
            };

            match step {
                Step::Done => break,
                Step::Skip => continue,
                Step::Start(item) => {
                    if !self.start_node(rt, item) {
                        break;
                    }
                }
            }
        }
    }

    fn start_node(&self, rt: &mut Runtime, item: usize) -> bool {
        let target = self.inner.borrow().target.clone();
        let events = self.endpoint_events();

        match target {
            Target::Connect(peer) => {
                let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

                let id = match rt.new_tcp(any, events) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!("tcp pool {}: cannot allocate endpoint: {}", self.name(), e);
                        self.revert_node(item);
                        return false;
                    }
                };

                if let Err(e) = rt.connect(id, peer) {
                    warn!("tcp pool {}: connect to {} failed: {}", self.name(), peer, e);
                    let _ = rt.close(id);
                    self.revert_node(item);
                    return false;
                }

                self.wire_node(item, id, None);
                trace!("tcp pool {}: node {} connecting via endpoint {}", self.name(), item, id);
                true
            }
            Target::Spawn { program, args } => {
                match rt.spawn_command(&program, &args, events) {
                    Ok(spawned) => {
                        let (id, child) = spawned.into_child();
                        self.wire_node(item, id, Some(child));
                        trace!(
                            "tcp pool {}: node {} spawned '{}' on endpoint {}",
                            self.name(),
                            item,
                            program,
                            id
                        );
                        true
                    }
                    Err(e) => {
                        warn!("tcp pool {}: cannot spawn '{}': {}", self.name(), program, e);
                        self.revert_node(item);
                        false
                    }
                }
            }
        }
    }

    fn wire_node(&self, item: usize, id: EndpointId, child: Option<Child>) {
        let mut inner = self.inner.borrow_mut();
        let node = inner.nodes.get_mut(item);
        node.endpoint = Some(id);

        if child.is_some() {
            node.prev_child = node.child.take();
            node.child = child;
        }

        inner.node_of.insert(id.index(), item);
    }

    fn revert_node(&self, item: usize) {
        self.inner
            .borrow_mut()
            .nodes
            .set_state(item, NodeState::Connecting, NodeState::Unconnected);
    }

    /// Ramp plus delivery of one queued ready-to-write, for the moments a
    /// connection (re)enters the idle state.
    fn restart(&self, rt: &mut Runtime) {
        self.ramp(rt);

        let cb = {
            let mut inner = self.inner.borrow_mut();

            if inner.queued_writes > 0 {
                inner.queued_writes -= 1;
                Some(inner.events.ready_to_write.clone())
            } else {
                None
            }
        };

        if let Some(cb) = cb {
            trace!("tcp pool {}: connection available; delivering queued write", self.name());
            cb(rt, self.clone());
        }
    }

    // ---- endpoint event handlers ----------------------------------------

    fn endpoint_events(&self) -> EndpointEvents {
        let connected_pool = self.clone();
        let read_pool = self.clone();
        let close_pool = self.clone();

        EndpointEvents::new(move |rt, id, length| {
            TcpPool::node_read(&read_pool, rt, id, length)
        })
        .on_connected(move |rt, id| TcpPool::node_connected(&connected_pool, rt, id))
        .on_close(move |rt, id| TcpPool::node_close(&close_pool, rt, id))
    }

    fn node_index(&self, id: EndpointId) -> Option<usize> {
        self.inner.borrow().node_of.get(&id.index()).copied()
    }

    fn node_connected(&self, rt: &mut Runtime, id: EndpointId) {
        let item = match self.node_index(id) {
            Some(item) => item,
            None => return,
        };

        trace!("tcp pool {}: node {} connection established", self.name(), item);

        // A replacement child connecting is the moment to judge how the
        // previous one went.
        let prev_child = self.inner.borrow_mut().nodes.get_mut(item).prev_child.take();

        if let Some(mut prev) = prev_child {
            match prev.try_wait() {
                Ok(None) => {
                    warn!(
                        "tcp pool {}: node {} previous process {} did not exit; killing it",
                        self.name(),
                        item,
                        prev.id()
                    );
                    let _ = prev.kill();
                    let _ = prev.wait();
                    self.bump_failures(item);
                }
                Ok(Some(status)) if !status.success() => {
                    warn!(
                        "tcp pool {}: node {} previous process {} exited with {}",
                        self.name(),
                        item,
                        prev.id(),
                        status
                    );
                    self.bump_failures(item);
                }
                Ok(Some(_)) => {
                    trace!("tcp pool {}: node {} previous process restarted gracefully", self.name(), item);
                }
                Err(e) => debug!("tcp pool {}: cannot reap previous process: {}", self.name(), e),
            }
        }

        let (has_initialization, connected_cb) = {
            let inner = self.inner.borrow();
            (inner.has_initialization, inner.events.connected.clone())
        };

        if has_initialization {
            self.inner.borrow_mut().nodes.set_state(
                item,
                NodeState::Connecting,
                NodeState::Initializing,
            );
        } else {
            self.inner.borrow_mut().nodes.set_state(
                item,
                NodeState::Connecting,
                NodeState::ReadyToSend,
            );
            self.restart(rt);
        }

        if let Some(cb) = connected_cb {
            cb(rt, self.clone(), id);
        }
    }

    fn node_read(&self, rt: &mut Runtime, id: EndpointId, length: usize) {
        let item = match self.node_index(id) {
            Some(item) => item,
            None => return,
        };

        let (state, read_cb) = {
            let inner = self.inner.borrow();
            (inner.nodes.state_of(item), inner.events.read.clone())
        };

        // During initialization the caller owns the conversation.
        if state == NodeState::Initializing {
            read_cb(rt, self.clone(), id, length);
            return;
        }

        self.inner.borrow_mut().nodes.get_mut(item).failures = 0;
        read_cb(rt, self.clone(), id, length);

        if !rt.is_open(id) || rt.buf_used(id) != 0 {
            return;
        }

        trace!("tcp pool {}: node {} reply consumed; ready to send again", self.name(), item);

        let cb = {
            let mut inner = self.inner.borrow_mut();

            if inner.nodes.state_of(item) != NodeState::InUse {
                None
            } else {
                inner
                    .nodes
                    .set_state(item, NodeState::InUse, NodeState::ReadyToSend);

                if inner.queued_writes > 0 {
                    inner.queued_writes -= 1;
                    Some(inner.events.ready_to_write.clone())
                } else {
                    None
                }
            }
        };

        if let Some(cb) = cb {
            cb(rt, self.clone());
        }
    }

    fn node_close(&self, rt: &mut Runtime, id: EndpointId) {
        let item = {
            let mut inner = self.inner.borrow_mut();

            match inner.node_of.remove(&id.index()) {
                Some(item) => item,
                None => return,
            }
        };

        let close_cb = {
            let mut inner = self.inner.borrow_mut();
            let state = inner.nodes.state_of(item);
            let is_spawn = matches!(inner.target, Target::Spawn { .. });

            // Spawned children report their own fate through the exit
            // status; a plain connection dropping always counts against the
            // node, as does a child that never managed to connect.
            if !is_spawn || state == NodeState::Connecting {
                inner.nodes.get_mut(item).failures += 1;
            }

            let failures = inner.nodes.get(item).failures;

            if failures >= MAX_FAILURES {
                info!(
                    "tcp pool {}: node {} has failed {} times: giving up on it",
                    inner.name, item, failures
                );
            } else {
                debug!(
                    "tcp pool {}: node {} has failed {} times: retrying",
                    inner.name, item, failures
                );
            }

            if state != NodeState::Unconnected {
                inner.nodes.set_state(item, state, NodeState::Unconnected);
            }

            inner.nodes.get_mut(item).endpoint = None;
            inner.events.close.clone()
        };

        if let Some(cb) = close_cb {
            cb(rt, self.clone(), id);
        }

        self.ramp(rt);
    }

    fn bump_failures(&self, item: usize) {
        self.inner.borrow_mut().nodes.get_mut(item).failures += 1;
    }

    // ---- supervision -----------------------------------------------------

    /// Scans the supervised states for overstayed nodes; each one gets the
    /// user's timeout callback and a forced close, then the ramp restarts
    /// it.
    fn check_timeouts(&self, rt: &mut Runtime) {
        let now = Instant::now();

        loop {
            let expired = {
                let inner = self.inner.borrow();

                [NodeState::Initializing, NodeState::InUse]
                    .iter()
                    .find_map(|&state| {
                        inner.nodes.expired_head(state, now).map(|item| (item, state))
                    })
            };

            let (item, state) = match expired {
                Some(expired) => expired,
                None => break,
            };

            let (timeout_cb, endpoint) = {
                let inner = self.inner.borrow();
                (inner.events.timeout.clone(), inner.nodes.get(item).endpoint)
            };

            if let Some(cb) = timeout_cb {
                cb(rt, self.clone());
            }

            match endpoint {
                Some(id) => {
                    warn!(
                        "tcp pool {}: node {} timed out in {:?}; closing endpoint {}",
                        self.name(),
                        item,
                        state,
                        id
                    );
                    let _ = rt.close(id);
                    self.node_close(rt, id);
                }
                None => {
                    // No endpoint to close; unblock the scan directly.
                    let mut inner = self.inner.borrow_mut();
                    inner.nodes.set_state(item, state, NodeState::Unconnected);
                }
            }
        }
    }
}
