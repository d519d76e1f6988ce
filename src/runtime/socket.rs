//! Listening socket setup and non-blocking accept.
//!
//! Every descriptor that reaches a dispatcher is non-blocking: the
//! listener is switched before `listen`, and each accepted stream is
//! switched before it is handed out.

use crate::runtime::connection::Connection;
use crate::runtime::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};

/// A bound, listening, non-blocking TCP socket.
#[derive(Debug)]
pub struct ListeningSocket {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl ListeningSocket {
    /// Address the socket is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Duplicate the descriptor. Both handles refer to the same accept queue.
    #[cfg(test)]
    pub fn try_clone(&self) -> Result<Self> {
        let inner = self.inner.try_clone().map_err(Error::SocketCreate)?;
        Ok(Self {
            inner,
            local_addr: self.local_addr,
        })
    }
}

impl AsRawFd for ListeningSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Result of a single accept attempt.
#[derive(Debug)]
pub enum Accepted {
    Connection(Connection),
    /// No connection is pending. Not an error.
    WouldBlock,
}

/// Create a listener on `host:port` with `SO_REUSEADDR`.
pub fn create_listener(host: IpAddr, port: u32, backlog: i32) -> Result<ListeningSocket> {
    let port_u16 = u16::try_from(port).map_err(|_| Error::Bind {
        port,
        source: io::Error::new(io::ErrorKind::InvalidInput, "port out of range"),
    })?;
    let addr = SocketAddr::new(host, port_u16);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::SocketCreate)?;
    socket
        .set_reuse_address(true)
        .map_err(Error::SocketCreate)?;
    socket
        .bind(&addr.into())
        .map_err(|source| Error::Bind { port, source })?;
    set_nonblocking(socket.as_raw_fd())?;
    socket
        .listen(backlog)
        .map_err(|source| Error::Bind { port, source })?;

    let inner: TcpListener = socket.into();
    let local_addr = inner.local_addr().map_err(Error::SocketCreate)?;

    Ok(ListeningSocket { inner, local_addr })
}

/// Switch a descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL does not touch memory; an invalid
    // descriptor is reported through errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::SetNonBlocking {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::SetNonBlocking {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Whether `O_NONBLOCK` is set on a descriptor.
#[cfg(test)]
pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    // SAFETY: see `set_nonblocking`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Attempt one non-blocking accept.
///
/// `EINTR` and `ECONNABORTED` are retried here; any other failure is
/// returned as `AcceptTransient` and the caller treats it like an empty
/// queue.
pub fn accept_one(listener: &ListeningSocket) -> Result<Accepted> {
    loop {
        match listener.inner.accept() {
            Ok((stream, peer)) => {
                set_nonblocking(stream.as_raw_fd())?;
                return Ok(Accepted::Connection(Connection::new(stream, peer)));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(Accepted::WouldBlock)
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue
            }
            Err(e) => return Err(Error::AcceptTransient(e)),
        }
    }
}
