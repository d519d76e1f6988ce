//! Level-triggered epoll readiness strategy.
//!
//! Descriptors are registered once and stay registered until close. The
//! kernel keeps reporting a socket while unread data remains, so the
//! dispatcher may stop reading at a quota and pick the rest up on the
//! next cycle.

use crate::runtime::readiness::{
    timeout_millis, EventReport, ReadPolicy, Readiness, Ready, StrategyKind,
};
use mio::Interest;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct EpollStrategy {
    epoll: OwnedFd,
    events: Vec<libc::epoll_event>,
    read_quota: usize,
}

impl EpollStrategy {
    /// Create an epoll instance that returns at most `max_events` per wait.
    pub fn new(max_events: usize, read_quota: usize) -> io::Result<Self> {
        // SAFETY: epoll_create1 has no memory arguments.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by the kernel and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            epoll,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
            read_quota,
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.map_or(0, epoll_flags),
            u64: fd as u64,
        };
        // SAFETY: `event` outlives the call; the kernel copies it.
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Level-triggered flags: no `EPOLLET`.
///
/// `EPOLLRDHUP` rides with read interest only; a half-closed socket that is
/// just flushing output would otherwise be reported on every wait.
fn epoll_flags(interest: Interest) -> u32 {
    let mut flags = 0;
    if interest.is_readable() {
        flags |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
        flags |= libc::EPOLLOUT as u32;
    }
    flags
}

impl Readiness for EpollStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Level
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&mut self, report: &mut EventReport, timeout: Option<Duration>) -> io::Result<()> {
        report.clear();

        // SAFETY: `events` is a live buffer of `len` epoll_event structs.
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in &self.events[..n as usize] {
            // Copy out of the (packed on x86_64) struct before use.
            let flags = event.events;
            let fd = event.u64 as RawFd;
            report.push(
                fd,
                Ready {
                    readable: flags & libc::EPOLLIN as u32 != 0,
                    writable: flags & libc::EPOLLOUT as u32 != 0,
                    hangup: flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
                    error: flags & libc::EPOLLERR as u32 != 0,
                },
            );
        }

        Ok(())
    }

    fn read_policy(&self) -> ReadPolicy {
        ReadPolicy::Quota(self.read_quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{stream_pair, wait_until};
    use std::io::{Read, Write};

    const SHORT: Option<Duration> = Some(Duration::from_millis(20));

    #[test]
    fn test_level_triggered_rereports_undrained() {
        let (mut client, mut server) = stream_pair();
        let fd = server.as_raw_fd();

        let mut epoll = EpollStrategy::new(16, 4096).unwrap();
        epoll.register(fd, Interest::READABLE).unwrap();

        client.write_all(b"0123456789").unwrap();
        let mut report = EventReport::default();
        wait_until("readable", || {
            epoll.wait(&mut report, SHORT).unwrap();
            report.contains(fd)
        });

        // Partial read: the remainder keeps the socket readable.
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        epoll.wait(&mut report, SHORT).unwrap();
        assert!(report.contains(fd));

        let mut rest = [0u8; 6];
        server.read_exact(&mut rest).unwrap();
        epoll.wait(&mut report, SHORT).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_deregistered_fd_is_not_reported() {
        let (mut client, server) = stream_pair();
        let fd = server.as_raw_fd();

        let mut epoll = EpollStrategy::new(16, 4096).unwrap();
        epoll.register(fd, Interest::READABLE).unwrap();
        client.write_all(b"x").unwrap();
        wait_until("readable", || {
            let mut report = EventReport::default();
            epoll.wait(&mut report, SHORT).unwrap();
            report.contains(fd)
        });

        epoll.deregister(fd).unwrap();
        client.write_all(b"more").unwrap();

        let mut report = EventReport::default();
        epoll
            .wait(&mut report, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(!report.contains(fd));
    }

    #[test]
    fn test_registration_errors() {
        let (_client, server) = stream_pair();
        let fd = server.as_raw_fd();

        let mut epoll = EpollStrategy::new(16, 4096).unwrap();
        assert!(epoll.reregister(fd, Interest::READABLE).is_err());
        epoll.register(fd, Interest::READABLE).unwrap();
        assert_eq!(
            epoll.register(fd, Interest::READABLE).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
        epoll.deregister(fd).unwrap();
        assert!(epoll.deregister(fd).is_err());
        assert_eq!(epoll.read_policy(), ReadPolicy::Quota(4096));
    }

    #[test]
    fn test_wait_respects_timeout() {
        let mut epoll = EpollStrategy::new(16, 4096).unwrap();
        let mut report = EventReport::default();
        let start = std::time::Instant::now();
        epoll
            .wait(&mut report, Some(Duration::from_millis(30)))
            .unwrap();
        assert!(report.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
