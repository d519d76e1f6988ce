//! `poll(2)` readiness strategy.
//!
//! Registration is bookkeeping only. Every wait rebuilds the `pollfd`
//! array from the full interest set and hands all of it to the kernel, so
//! each cycle costs O(registered descriptors) no matter how many are
//! active. That cost is what this strategy exists to measure.

use crate::runtime::readiness::{
    timeout_millis, EventReport, ReadPolicy, Readiness, Ready, StrategyKind,
};
use mio::Interest;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct PollStrategy {
    interests: BTreeMap<RawFd, Interest>,
    fds: Vec<libc::pollfd>,
    read_quota: usize,
}

impl PollStrategy {
    pub fn new(read_quota: usize) -> Self {
        Self {
            interests: BTreeMap::new(),
            fds: Vec::new(),
            read_quota,
        }
    }

    /// Number of descriptors that will be handed to the next wait.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}

fn poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

impl Readiness for PollStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Poll
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.interests.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.interests.get_mut(&fd) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            )),
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))
    }

    fn wait(&mut self, report: &mut EventReport, timeout: Option<Duration>) -> io::Result<()> {
        report.clear();

        self.fds.clear();
        self.fds
            .extend(self.interests.iter().map(|(&fd, &interest)| libc::pollfd {
                fd,
                events: poll_events(interest),
                revents: 0,
            }));

        // SAFETY: `fds` is a live, correctly sized array of pollfd structs
        // for the duration of the call.
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
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

        for pfd in self.fds.iter().filter(|pfd| pfd.revents != 0) {
            let revents = pfd.revents;
            report.push(
                pfd.fd,
                Ready {
                    readable: revents & libc::POLLIN != 0,
                    writable: revents & libc::POLLOUT != 0,
                    hangup: revents & libc::POLLHUP != 0,
                    error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                },
            );
        }

        Ok(())
    }

    fn read_policy(&self) -> ReadPolicy {
        ReadPolicy::Quota(self.read_quota)
    }
}
