//! A supervised pool of outbound connections.
//!
//! A [`TcpPool`] keeps a fixed number of connections to one target — either
//! a TCP `ip:port` or a spawned child process reached over a socketpair —
//! and hands idle connections to the caller on demand. Nodes ramp up a few
//! at a time, failures are counted and repeat offenders retired, and two
//! optional timeouts supervise the protocol: one for application-level
//! initialization after connect, one for the response to an in-flight
//! request.
//!
//! The pool folds the connect/read/close events of its endpoints into a
//! per-node state machine:
//!
//! ```text
//! Unconnected → Connecting → [Initializing →] ReadyToSend ⇄ InUse
//!      ▲                                          (write)   (reply consumed)
//!      └────────────── close / timeout ──────────────┘
//! ```

mod pool;

pub use crate::pool::{
    NodeState, PoolEvents, PoolTimeouts, TcpPool, PoolConnectedFn, PoolCloseFn, PoolFn, PoolReadFn,
};
