//! Errors raised by the dispatch runtime.
//!
//! Startup failures (`SocketCreate`, `Bind`, `SetNonBlocking`) are fatal.
//! During steady-state dispatch most failures stay local to one connection;
//! only `Wait` and table misuse escape a dispatcher.

use crate::runtime::connection::Connection;
use std::io;
use std::os::unix::io::RawFd;

/// Runtime error taxonomy.
#[derive(Debug)]
pub enum Error {
    /// The socket could not be created (usually descriptor exhaustion).
    SocketCreate(io::Error),
    /// The port is in use, out of range, or the address is not bindable.
    Bind { port: u32, source: io::Error },
    /// A descriptor could not be switched to non-blocking mode.
    SetNonBlocking { fd: RawFd, source: io::Error },
    /// `accept` failed for a reason other than an empty queue.
    AcceptTransient(io::Error),
    /// Registering, modifying or removing interest failed.
    Registration { fd: RawFd, source: io::Error },
    /// The readiness wait itself failed.
    Wait(io::Error),
    /// A worker process could not be forked, or reaped.
    Fork(io::Error),
    /// A connection with the same handle is already in the table.
    ///
    /// The rejected connection is handed back so the caller decides
    /// what happens to its descriptor.
    DuplicateHandle(Box<Connection>),
    /// No connection is registered under this handle.
    NotFound(RawFd),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SocketCreate(e) => write!(f, "failed to create socket: {e}"),
            Error::Bind { port, source } => write!(f, "failed to bind port {port}: {source}"),
            Error::SetNonBlocking { fd, source } => {
                write!(f, "failed to set fd {fd} non-blocking: {source}")
            }
            Error::AcceptTransient(e) => write!(f, "accept failed: {e}"),
            Error::Registration { fd, source } => {
                write!(f, "failed to update interest for fd {fd}: {source}")
            }
            Error::Wait(e) => write!(f, "readiness wait failed: {e}"),
            Error::Fork(e) => write!(f, "worker process management failed: {e}"),
            Error::DuplicateHandle(conn) => {
                write!(f, "fd {} is already in the connection table", conn.fd())
            }
            Error::NotFound(fd) => write!(f, "fd {fd} is not in the connection table"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SocketCreate(e)
            | Error::AcceptTransient(e)
            | Error::Wait(e)
            | Error::Fork(e) => Some(e),
            Error::Bind { source, .. }
            | Error::SetNonBlocking { source, .. }
            | Error::Registration { source, .. } => Some(source),
            Error::DuplicateHandle(_) | Error::NotFound(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
