//! Error and result types shared by every runtime operation.

use std::io;

use derive_more::{Display, Error};

/// Everything that can go wrong with an endpoint operation.
///
/// The set is closed on purpose: callers are expected to match on it, and the
/// runtime never surfaces raw OS errors (those are logged at the point of
/// failure instead).
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The pool backing the operation has no free element.
    #[display(fmt = "no unused pool elements")]
    NoUnusedElements,

    /// The local address is already bound by someone else.
    #[display(fmt = "address already in use")]
    AddressInUse,

    /// The endpoint already has a socket.
    #[display(fmt = "endpoint is already connected")]
    AlreadyConnected,

    /// The operation needs a connection that is not there (any more).
    #[display(fmt = "endpoint has no connection")]
    NoConnection,

    /// Transient back-pressure. Internal: public operations report
    /// [`SendStatus::InProgress`](crate::SendStatus) instead of surfacing
    /// this.
    #[display(fmt = "operation would block")]
    WouldBlock,

    /// The stream ended cleanly.
    #[display(fmt = "end of file")]
    EndOfFile,

    /// An unrecoverable send failure; the endpoint has been closed.
    #[display(fmt = "write failed")]
    WriteFailed,

    /// The endpoint was already closed; double close is tolerated.
    #[display(fmt = "endpoint is already closed")]
    AlreadyClosed,

    /// A precondition or invariant did not hold. Details are logged.
    #[display(fmt = "internal error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a send-side operation did synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything was handed to the OS.
    Complete,
    /// Back-pressure: the rest goes out as the socket drains, and any
    /// completion callback fires when it does.
    InProgress,
}

/// Delivered to send completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The data was written in full.
    Ok,
    /// The source hit end of file before `total` bytes (sendfile only).
    EndOfFile,
    /// The send failed; for queued buffers this is the release notification.
    Failed(Error),
}

pub(crate) fn io_to_error(err: &io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::WouldBlock => Error::WouldBlock,
        io::ErrorKind::AddrInUse => Error::AddressInUse,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => Error::NoConnection,
        _ => Error::Internal,
    }
}
