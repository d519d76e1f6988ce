//! The dispatch loop shared by every readiness strategy.
//!
//! One turn: wait for readiness, accept everything pending on the
//! listener, service each reported connection, then sweep idle
//! connections. The strategy decides how readiness is discovered and how
//! hard a socket must be drained; everything else is identical across
//! strategies so that runs are comparable.

use crate::runtime::connection::{ConnState, Connection, ConnectionTable};
use crate::runtime::error::{Error, Result};
use crate::runtime::protocol::Handler;
use crate::runtime::readiness::{EventReport, ReadPolicy, Readiness, Ready};
use crate::runtime::socket::{accept_one, Accepted, ListeningSocket};
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Wait bound while accepted connections may still be queued behind a
/// failed `accept`. Edge-triggered listeners are not reported again.
const ACCEPT_RETRY: Duration = Duration::from_millis(10);

/// How often `run` logs a stats summary.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Tunables for one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Connections beyond this are accepted and closed immediately.
    pub max_connections: usize,
    /// Upper bound on events returned by one wait.
    pub max_events: usize,
    /// Size of a single `read` call.
    pub read_chunk: usize,
    /// Per-connection bytes per turn for strategies that re-report.
    pub read_quota: usize,
    /// Pending output above this closes the connection.
    pub max_outbound: usize,
    /// Wait timeout; `None` blocks until something is ready.
    pub wait_timeout: Option<Duration>,
    /// Close connections with no I/O for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_events: 1024,
            read_chunk: 16 * 1024,
            read_quota: 64 * 1024,
            max_outbound: 4 * 1024 * 1024,
            wait_timeout: None,
            idle_timeout: None,
        }
    }
}

/// Counters for one dispatcher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub turns: u64,
    pub accepted: u64,
    /// Accepted then closed because of `max_connections`.
    pub rejected: u64,
    pub closed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// What to do with a connection after servicing it.
enum Next {
    Keep,
    Close(&'static str),
}

pub struct Dispatcher<S, H> {
    listener: ListeningSocket,
    strategy: S,
    handler: H,
    table: ConnectionTable,
    report: EventReport,
    scratch: Vec<u8>,
    settings: DispatchSettings,
    stats: DispatchStats,
    last_sweep: Instant,
    /// The last accept pass stopped on an error, not on `WouldBlock`.
    listener_pending: bool,
}

impl<S: Readiness, H: Handler> Dispatcher<S, H> {
    /// Take ownership of the listener and register it with `strategy`.
    pub fn new(
        listener: ListeningSocket,
        mut strategy: S,
        handler: H,
        settings: DispatchSettings,
    ) -> Result<Self> {
        let fd = listener.fd();
        strategy
            .register(fd, Interest::READABLE)
            .map_err(|source| Error::Registration { fd, source })?;

        Ok(Self {
            listener,
            strategy,
            handler,
            table: ConnectionTable::with_capacity(1024),
            report: EventReport::with_capacity(settings.max_events),
            scratch: vec![0u8; settings.read_chunk.max(1)],
            settings,
            stats: DispatchStats::default(),
            last_sweep: Instant::now(),
            listener_pending: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    #[cfg(test)]
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    #[cfg(test)]
    pub fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Run turns until a fatal error.
    pub fn run(&mut self) -> Result<()> {
        let timeout = self.wait_timeout();
        info!(
            strategy = ?self.strategy.kind(),
            addr = %self.local_addr(),
            read_policy = ?self.strategy.read_policy(),
            "Dispatcher started"
        );

        let mut last_report = Instant::now();
        loop {
            self.turn(timeout)?;

            if last_report.elapsed() >= STATS_INTERVAL {
                let stats = self.stats();
                debug!(
                    turns = stats.turns,
                    accepted = stats.accepted,
                    rejected = stats.rejected,
                    closed = stats.closed,
                    live = self.table.len(),
                    bytes_read = stats.bytes_read,
                    bytes_written = stats.bytes_written,
                    "Dispatcher stats"
                );
                last_report = Instant::now();
            }
        }
    }

    /// Execute one dispatch cycle. Returns the number of reported events.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let timeout = if self.listener_pending {
            Some(timeout.map_or(ACCEPT_RETRY, |t| t.min(ACCEPT_RETRY)))
        } else {
            timeout
        };
        self.strategy
            .wait(&mut self.report, timeout)
            .map_err(Error::Wait)?;
        self.stats.turns += 1;

        let report = std::mem::take(&mut self.report);
        let listener_fd = self.listener.fd();

        if self.listener_pending || report.contains(listener_fd) {
            self.accept_pending()?;
        }

        for event in report.iter().filter(|event| event.fd != listener_fd) {
            self.service(event.fd, event.ready)?;
        }

        if report.is_empty() {
            trace!(turn = self.stats.turns, "Wait timed out");
        }
        let handled = report.len();
        self.report = report;

        self.sweep_idle()?;
        Ok(handled)
    }

    fn wait_timeout(&self) -> Option<Duration> {
        match (self.settings.wait_timeout, self.sweep_interval()) {
            (Some(wait), Some(sweep)) => Some(wait.min(sweep)),
            (wait, sweep) => wait.or(sweep),
        }
    }

    fn sweep_interval(&self) -> Option<Duration> {
        self.settings
            .idle_timeout
            .map(|idle| idle.min(Duration::from_secs(1)))
    }

    /// Accept until the listener reports `WouldBlock`.
    ///
    /// A failed accept leaves `listener_pending` set so the next turn
    /// retries without waiting for a fresh listener event.
    fn accept_pending(&mut self) -> Result<()> {
        loop {
            let conn = match accept_one(&self.listener) {
                Ok(Accepted::Connection(conn)) => conn,
                Ok(Accepted::WouldBlock) => {
                    self.listener_pending = false;
                    return Ok(());
                }
                Err(Error::AcceptTransient(e)) => {
                    if !self.listener_pending {
                        warn!(error = %e, "Accept failed, retrying next cycle");
                    }
                    self.listener_pending = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Dropping accepted connection");
                    continue;
                }
            };

            if self.table.len() >= self.settings.max_connections {
                warn!(peer = %conn.peer(), "Connection limit reached");
                self.stats.rejected += 1;
                continue;
            }

            let fd = conn.fd();
            if let Err(source) = self.strategy.register(fd, Interest::READABLE) {
                let err = Error::Registration { fd, source };
                warn!(error = %err, "Closing unregistered connection");
                continue;
            }

            let peer = conn.peer();
            self.table.insert(conn)?;
            self.stats.accepted += 1;

            debug!(fd, peer = %peer, "Accepted connection");
        }
    }

    fn service(&mut self, fd: RawFd, ready: Ready) -> Result<()> {
        let policy = self.strategy.read_policy();
        let max_outbound = self.settings.max_outbound;

        let Ok(conn) = self.table.lookup(fd) else {
            // Closed earlier in this turn.
            return Ok(());
        };

        let next = drive(
            conn,
            ready,
            policy,
            &mut self.scratch,
            &mut self.handler,
            &mut self.stats,
            max_outbound,
        );

        match next {
            Ok(Next::Keep) => {
                let desired = conn.desired_interest();
                if desired != conn.registered {
                    if let Err(source) = self.strategy.reregister(fd, desired) {
                        let err = Error::Registration { fd, source };
                        warn!(error = %err, "Force-closing connection");
                        return self.close(fd, "registration failed");
                    }
                    conn.registered = desired;
                }
                Ok(())
            }
            Ok(Next::Close(reason)) => self.close(fd, reason),
            Err(e) => {
                debug!(fd, error = %e, "Connection error");
                self.close(fd, "io error")
            }
        }
    }

    /// Remove, deregister and close a connection.
    fn close(&mut self, fd: RawFd, reason: &'static str) -> Result<()> {
        let conn = self.table.remove(fd)?;
        if let Err(source) = self.strategy.deregister(fd) {
            let err = Error::Registration { fd, source };
            warn!(error = %err, "Deregistration failed");
        }
        self.stats.closed += 1;

        debug!(
            fd,
            peer = %conn.peer(),
            reason,
            bytes_read = conn.bytes_read,
            bytes_written = conn.bytes_written,
            "Connection closed"
        );
        self.handler.on_close(&conn);
        Ok(())
    }

    fn sweep_idle(&mut self) -> Result<()> {
        let (Some(idle), Some(interval)) = (self.settings.idle_timeout, self.sweep_interval())
        else {
            return Ok(());
        };

        let now = Instant::now();
        if self.table.is_empty() || now.duration_since(self.last_sweep) < interval {
            return Ok(());
        }
        self.last_sweep = now;

        let expired: Vec<RawFd> = self
            .table
            .iter()
            .filter(|conn| now.duration_since(conn.last_active) >= idle)
            .map(Connection::fd)
            .collect();

        for fd in expired {
            self.close(fd, "idle timeout")?;
        }
        Ok(())
    }
}

/// Read, hand new bytes to the handler, and flush output.
fn drive<H: Handler>(
    conn: &mut Connection,
    ready: Ready,
    policy: ReadPolicy,
    scratch: &mut [u8],
    handler: &mut H,
    stats: &mut DispatchStats,
    max_outbound: usize,
) -> io::Result<Next> {
    if ready.error {
        return Ok(Next::Close("socket error"));
    }

    if (ready.readable || ready.hangup) && conn.state != ConnState::Closing {
        let pass = conn.read_available(policy, scratch)?;
        stats.bytes_read += pass.bytes as u64;
        if pass.bytes > 0 {
            handler.on_data(conn.fd(), &mut conn.inbound, &mut conn.outbound);
        }
        if pass.eof {
            trace!(fd = conn.fd(), pending = conn.outbound.len(), "Peer closed, flushing");
        }
    }

    if !conn.outbound.is_empty() {
        stats.bytes_written += conn.flush()? as u64;
    }

    if conn.is_finished() {
        return Ok(Next::Close("peer closed"));
    }
    if conn.outbound.len() > max_outbound {
        return Ok(Next::Close("outbound backlog exceeded"));
    }
    Ok(Next::Keep)
}
