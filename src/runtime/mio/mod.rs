//! Edge-triggered readiness strategy built on mio.
//!
//! mio registers every source with `EPOLLET` on Linux (`EV_CLEAR` on
//! kqueue), so a readiness transition is reported exactly once. Anything
//! left unread after a report produces no further notification until new
//! data arrives, which is why this strategy demands a read-until-WouldBlock
//! discipline.
//!
//! Multi-process fan-out over a shared listener lives in [`workers`].

mod workers;

pub use workers::spawn_workers;

use crate::runtime::readiness::{EventReport, ReadPolicy, Readiness, Ready, StrategyKind};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct MioStrategy {
    poll: Poll,
    events: Events,
}

impl MioStrategy {
    /// Create a poll instance that returns at most `max_events` per wait.
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events.max(1)),
        })
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

impl Readiness for MioStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Edge
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token(fd), interest)
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token(fd), interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, report: &mut EventReport, timeout: Option<Duration>) -> io::Result<()> {
        report.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            report.push(
                event.token().0 as RawFd,
                Ready {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    hangup: event.is_read_closed(),
                    error: event.is_error(),
                },
            );
        }

        Ok(())
    }

    fn read_policy(&self) -> ReadPolicy {
        ReadPolicy::UntilWouldBlock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{stream_pair, wait_until};
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    const SHORT: Option<Duration> = Some(Duration::from_millis(20));

    #[test]
    fn test_edge_reports_transition_once() {
        let (mut client, mut server) = stream_pair();
        let fd = server.as_raw_fd();

        let mut strategy = MioStrategy::new(16).unwrap();
        strategy.register(fd, Interest::READABLE).unwrap();

        client.write_all(b"0123456789").unwrap();
        let mut report = EventReport::default();
        wait_until("readable", || {
            strategy.wait(&mut report, SHORT).unwrap();
            report.contains(fd)
        });

        // A partial read does not produce a second notification.
        let mut head = [0u8; 4];
        server.read_exact(&mut head).unwrap();
        strategy
            .wait(&mut report, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(!report.contains(fd));

        // Draining to WouldBlock on the first report recovers the rest.
        let mut rest = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            match server.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => rest.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(&head, b"0123");
        assert_eq!(rest, b"456789");

        // New data is a new edge.
        client.write_all(b"x").unwrap();
        wait_until("second edge", || {
            strategy.wait(&mut report, SHORT).unwrap();
            report.contains(fd)
        });
    }

    #[test]
    fn test_deregistered_fd_is_not_reported() {
        let (mut client, server) = stream_pair();
        let fd = server.as_raw_fd();

        let mut strategy = MioStrategy::new(16).unwrap();
        strategy.register(fd, Interest::READABLE).unwrap();
        strategy.deregister(fd).unwrap();

        client.write_all(b"late").unwrap();
        let mut report = EventReport::default();
        strategy
            .wait(&mut report, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(!report.contains(fd));
    }

    #[test]
    fn test_reregister_for_writable() {
        let (_client, server) = stream_pair();
        let fd = server.as_raw_fd();

        let mut strategy = MioStrategy::new(16).unwrap();
        strategy.register(fd, Interest::READABLE).unwrap();
        strategy
            .reregister(fd, Interest::READABLE | Interest::WRITABLE)
            .unwrap();

        let mut report = EventReport::default();
        wait_until("writable", || {
            strategy.wait(&mut report, SHORT).unwrap();
            report.iter().any(|e| e.fd == fd && e.ready.writable)
        });
        assert_eq!(strategy.read_policy(), ReadPolicy::UntilWouldBlock);
    }
}
