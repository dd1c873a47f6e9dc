//! Axon is a runtime for writing high-concurrency, event-driven network
//! servers and clients around a single-threaded readiness loop.
//!
//! The central object is the *endpoint*: a pooled handle over one network
//! conversation — a listening socket, an accepted or outbound TCP
//! connection, a UDP port, a UNIX-domain pipe, or one end of a socketpair.
//! Endpoints deliver their life as callbacks (*connected*, *read*, *close*),
//! buffer reads with consumer-controlled pacing, buffer writes with
//! flow-control, and can optionally terminate TLS.
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! use axon::{EndpointEvents, Runtime};
//!
//! fn main() -> axon::Result<()> {
//!     let mut rt = Runtime::builder().endpoints(100).build()?;
//!
//!     let events = EndpointEvents::new(|rt, id, _length| {
//!         // Echo whatever arrives, then release it.
//!         let data = rt.buf(id).to_vec();
//!         let _ = rt.write(id, &data);
//!         rt.buf_clear(id);
//!     });
//!
//!     let listener = rt.new_tcp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8000), events)?;
//!     rt.listen(listener)?;
//!     rt.run()
//! }
//! ```
//!
//! # Concurrency model
//!
//! Exactly one thread runs the loop and every callback; there are no locks
//! and no blocking operations. Callbacks on one endpoint are serialized in
//! event order. A callback may freely operate on its own endpoint —
//! including closing it and claiming a fresh one from the freed slot.
//!
//! # Features
//!
//! - `ssl` (default): TLS termination via OpenSSL.

#![allow(clippy::too_many_arguments)]

mod buffer;
mod endpoint;
mod error;
mod pipe;
mod runtime;
mod send;
mod sock;
mod spawn;
#[cfg(feature = "ssl")]
mod ssl;
mod timer;

pub use crate::endpoint::{
    ConnectedFn, CloseFn, EndpointEvents, EndpointId, ReadFn, ResumeMode, WrittenFn, BUF_SIZE,
};
pub use crate::error::{Error, Result, SendOutcome, SendStatus};
pub use crate::runtime::{Builder, Runtime, Waker};
pub use crate::send::SendBuffer;
pub use crate::spawn::Spawned;
#[cfg(feature = "ssl")]
pub use crate::ssl::SslInfo;
pub use crate::timer::TimerId;
