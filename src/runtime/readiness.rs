//! The interface shared by the three multiplexing strategies.
//!
//! A strategy tracks which descriptors are interesting, blocks until some
//! of them are ready, and tells the dispatcher how hard it must drain a
//! socket once it has been reported.

use mio::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Which strategy a dispatcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// `poll(2)` over a rebuilt interest list.
    Poll,
    /// Level-triggered epoll.
    Level,
    /// Edge-triggered notification, one process per worker.
    Edge,
}

/// How much to read from a socket after it is reported readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Stop after this many bytes even if more is pending. Only sound when
    /// the strategy re-reports undrained sockets.
    Quota(usize),
    /// Read until `WouldBlock`. Required under edge triggering.
    UntilWouldBlock,
}

/// Readiness flags for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or shut down its write half.
    pub hangup: bool,
    pub error: bool,
}

/// One entry of an [`EventReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub ready: Ready,
}

/// The batch of events returned by one `wait` call.
///
/// Reused across turns so steady-state dispatch does not allocate.
#[derive(Debug, Default)]
pub struct EventReport {
    events: Vec<ReadyEvent>,
}

impl EventReport {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn push(&mut self, fd: RawFd, ready: Ready) {
        self.events.push(ReadyEvent { fd, ready });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadyEvent> {
        self.events.iter()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.events.iter().any(|e| e.fd == fd)
    }
}

/// A readiness notification facility.
pub trait Readiness {
    fn kind(&self) -> StrategyKind;

    /// Start watching `fd`. A descriptor is never reported before this.
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Replace the interest of an already registered descriptor.
    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`. Must happen before the descriptor is closed.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until at least one registered descriptor is ready or the
    /// timeout expires (`None` blocks indefinitely). The report is cleared
    /// first; an interrupted wait leaves it empty.
    fn wait(&mut self, report: &mut EventReport, timeout: Option<Duration>) -> io::Result<()>;

    /// Read discipline this strategy's notification semantics require.
    fn read_policy(&self) -> ReadPolicy;
}

/// Convert a wait timeout to the millisecond argument of `poll`/`epoll_wait`.
///
/// Sub-millisecond timeouts round up so a short wait never becomes a spin.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let ms = d.as_millis().max(1);
            libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
        }
    }
}
