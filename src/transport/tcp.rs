//! Plain TCP link and socket setup.
//!
//! Sockets are created with socket2 so that address reuse, the IPv6-only flag
//! and the listen backlog can be set before they are handed to mio.

use super::{IoStatus, Link, TransportKind, Want, Wire};
use crate::error::Error;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, SockRef, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::{trace, warn};

// The kernel clamps this to its own maximum (net.core.somaxconn on Linux).
const LISTEN_BACKLOG: i32 = 4096;

pub(crate) struct PlainLink {
    stream: TcpStream,
}

impl PlainLink {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Wire for PlainLink {
    fn recv(&mut self, buf: &mut [u8]) -> Result<IoStatus, Error> {
        loop {
            match self.stream.read(buf) {
                Ok(sz) => {
                    trace!(len = sz, "Read from socket");
                    return Ok(IoStatus::Ready(sz));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(IoStatus::Blocked(Want::Read))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, Error> {
        loop {
            match self.stream.write(buf) {
                Ok(0) if !buf.is_empty() => {
                    return Err(io::Error::from(ErrorKind::WriteZero).into())
                }
                Ok(sz) => {
                    trace!(len = sz, "Wrote to socket");
                    return Ok(IoStatus::Ready(sz));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(IoStatus::Blocked(Want::Write))
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Link for PlainLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn stream(&self) -> &TcpStream {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn into_stream(self: Box<Self>) -> TcpStream {
        self.stream
    }

    fn close(&mut self) {
        shutdown(&self.stream);
    }
}

pub(crate) fn shutdown(stream: &TcpStream) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => {}
        // The peer may already be gone, or the connect never completed.
        Err(err) if err.kind() == ErrorKind::NotConnected => {}
        Err(err) => warn!(?err, "Error shutting down socket"),
    }
}

/// Starts a TCP connect to `addr`.
///
/// Returns the stream and whether the connect already completed. In
/// non-blocking mode a `false` means the caller has to wait for writability
/// and then check [`connect_status`].
pub(crate) fn connect_stream(
    addr: SocketAddr,
    local: Option<SocketAddr>,
    blocking: bool,
) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    if let Some(local) = local.filter(|local| local.is_ipv4() == addr.is_ipv4()) {
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    socket.set_nonblocking(!blocking)?;

    let connected = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => false,
        Err(err) if err.kind() == ErrorKind::WouldBlock => false,
        Err(err) => return Err(err),
    };

    let stream = TcpStream::from_std(socket.into());
    stream.set_nodelay(true)?;
    Ok((stream, connected))
}

/// Checks whether a pending non-blocking connect has finished.
///
/// `Ok(false)` means still in progress. A failed connect surfaces as the
/// socket's pending error.
pub(crate) fn connect_status(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(err),
    }
}

/// Binds a passive socket with address reuse and the maximum backlog.
///
/// `ipv6_only` is applied to IPv6 addresses only; `None` keeps the system
/// default.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    ipv6_only: Option<bool>,
    blocking: bool,
) -> io::Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    if let (true, Some(only_v6)) = (addr.is_ipv6(), ipv6_only) {
        socket.set_only_v6(only_v6)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(!blocking)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Toggles the OS-level non-blocking flag of a live socket.
pub(crate) fn set_nonblocking<S: std::os::fd::AsFd>(socket: &S, nonblocking: bool) -> io::Result<()> {
    SockRef::from(socket).set_nonblocking(nonblocking)
}
