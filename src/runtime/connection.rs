//! Per-connection state and the table that owns it.
//!
//! Connections live in an arena indexed by their descriptor. Descriptors
//! are small, dense integers handed out by the kernel, so a `Vec` slot per
//! fd gives O(1) insert, lookup and remove without a separate key space.

use crate::runtime::error::{Error, Result};
use crate::runtime::readiness::ReadPolicy;
use bytes::{Buf, BytesMut};
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

const INITIAL_BUFFER: usize = 4 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Open, and the last read reached `WouldBlock` (or nothing was read yet).
    Accepted,
    /// The last read stopped at the quota; the kernel still holds data.
    ReadablePending,
    /// Peer closed its write half. Remaining output is flushed, then closed.
    Closing,
}

/// Outcome of one read pass over a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPass {
    /// Bytes appended to the inbound buffer.
    pub bytes: usize,
    /// The peer sent EOF.
    pub eof: bool,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// Current connection state.
    pub state: ConnState,
    /// Bytes read but not yet consumed by the handler.
    pub inbound: BytesMut,
    /// Bytes produced by the handler but not yet written.
    pub outbound: BytesMut,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub last_active: Instant,
    /// Interest currently registered with the readiness strategy.
    pub registered: Interest,
}

impl Connection {
    /// Wrap an accepted stream. The stream must already be non-blocking.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
            inbound: BytesMut::with_capacity(INITIAL_BUFFER),
            outbound: BytesMut::new(),
            bytes_read: 0,
            bytes_written: 0,
            last_active: Instant::now(),
            registered: Interest::READABLE,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read from the socket into `inbound` following `policy`.
    ///
    /// `scratch` bounds the size of each individual `read` call.
    pub fn read_available(
        &mut self,
        policy: ReadPolicy,
        scratch: &mut [u8],
    ) -> io::Result<ReadPass> {
        let mut total = 0;

        loop {
            let limit = match policy {
                ReadPolicy::Quota(quota) => {
                    if total >= quota {
                        self.state = ConnState::ReadablePending;
                        return Ok(ReadPass { bytes: total, eof: false });
                    }
                    scratch.len().min(quota - total)
                }
                ReadPolicy::UntilWouldBlock => scratch.len(),
            };

            match (&self.stream).read(&mut scratch[..limit]) {
                Ok(0) => {
                    self.state = ConnState::Closing;
                    return Ok(ReadPass { bytes: total, eof: true });
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&scratch[..n]);
                    self.bytes_read += n as u64;
                    self.last_active = Instant::now();
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.state != ConnState::Closing {
                        self.state = ConnState::Accepted;
                    }
                    return Ok(ReadPass { bytes: total, eof: false });
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of `outbound` as the socket accepts.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;

        while !self.outbound.is_empty() {
            match (&self.stream).write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    self.bytes_written += n as u64;
                    written += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if written > 0 {
            self.last_active = Instant::now();
        }
        Ok(written)
    }

    /// Interest this connection needs given its state and pending output.
    pub fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::Closing => Interest::WRITABLE,
            _ if self.outbound.is_empty() => Interest::READABLE,
            _ => Interest::READABLE | Interest::WRITABLE,
        }
    }

    /// A closing connection with nothing left to write can be torn down.
    pub fn is_finished(&self) -> bool {
        self.state == ConnState::Closing && self.outbound.is_empty()
    }
}

/// Arena of live connections indexed by descriptor.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    len: usize,
}

impl ConnectionTable {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the arena for descriptors up to `fds`.
    pub fn with_capacity(fds: usize) -> Self {
        let mut slots = Vec::with_capacity(fds);
        slots.resize_with(fds, || None);
        Self { slots, len: 0 }
    }

    /// Insert a connection under its descriptor.
    ///
    /// A taken slot means a connection was dropped without being removed
    /// first; the new connection is returned inside the error.
    pub fn insert(&mut self, conn: Connection) -> Result<()> {
        let Ok(idx) = usize::try_from(conn.fd()) else {
            return Err(Error::NotFound(conn.fd()));
        };
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }

        let slot = &mut self.slots[idx];
        if slot.is_some() {
            return Err(Error::DuplicateHandle(Box::new(conn)));
        }
        *slot = Some(conn);
        self.len += 1;
        Ok(())
    }

    /// Detach a connection for teardown.
    pub fn remove(&mut self, fd: RawFd) -> Result<Connection> {
        let conn = self
            .slot_mut(fd)
            .and_then(Option::take)
            .ok_or(Error::NotFound(fd))?;
        self.len -= 1;
        Ok(conn)
    }

    /// Exclusive access to a connection for the current turn.
    pub fn lookup(&mut self, fd: RawFd) -> Result<&mut Connection> {
        self.slot_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(Error::NotFound(fd))
    }

    #[cfg(test)]
    pub fn contains(&self, fd: RawFd) -> bool {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.slots.get(idx))
            .is_some_and(Option::is_some)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live connections in descriptor order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    fn slot_mut(&mut self, fd: RawFd) -> Option<&mut Option<Connection>> {
        usize::try_from(fd).ok().and_then(|idx| self.slots.get_mut(idx))
    }
}
