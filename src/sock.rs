//! Socket construction and small platform helpers.
//!
//! Sockets are built with `socket2` so options can be set before `bind`,
//! then handed to mio wrappers for registration with the poll.

use std::io;
use std::net::{self, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Builds a bound, listening, non-blocking TCP listener.
pub(crate) fn tcp_listener(local: SocketAddrV4, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddr::V4(local)))?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(net::TcpListener::from(socket))
}

/// Builds a non-blocking TCP socket with a connect in flight.
///
/// The local address is bound first when the caller picked one; `EINPROGRESS`
/// from `connect` is the expected outcome and is not an error.
pub(crate) fn tcp_connect(
    local: Option<SocketAddrV4>,
    peer: SocketAddrV4,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    if let Some(local) = local {
        socket.bind(&SockAddr::from(SocketAddr::V4(local)))?;
    }

    match socket.connect(&SockAddr::from(SocketAddr::V4(peer))) {
        Ok(()) => {}
        Err(ref e) if in_progress(e) => {}
        Err(e) => return Err(e),
    }

    TcpStream::from_stream(net::TcpStream::from(socket))
}

/// Builds a bound, non-blocking UDP socket.
pub(crate) fn udp_socket(local: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddr::V4(local)))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_socket(net::UdpSocket::from(socket))
}

fn in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn as_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

/// Bytes queued for reading on the socket, per `FIONREAD`, or `None` when
/// the kernel will not say.
pub(crate) fn bytes_readable(fd: RawFd) -> Option<usize> {
    let mut count: libc::c_int = 0;

    // Safety: FIONREAD writes one c_int through the pointer.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut count) };

    if rc < 0 {
        None
    } else {
        Some(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn bytes_readable_tracks_the_receive_queue() {
        let (mut a, b) = UnixStream::pair().unwrap();

        assert_eq!(bytes_readable(b.as_raw_fd()), Some(0));
        a.write_all(b"xyz").unwrap();
        assert_eq!(bytes_readable(b.as_raw_fd()), Some(3));
    }

    #[test]
    fn listener_resolves_an_os_assigned_port() {
        let listener = tcp_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let local = listener.local_addr().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn connect_tolerates_in_progress() {
        let listener = tcp_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let port = listener.local_addr().unwrap().port();

        // Must not error even though the handshake cannot have finished.
        tcp_connect(None, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
    }
}
