//! Forked worker processes sharing one listening socket.
//!
//! The listener is created before forking, so every child inherits the
//! same descriptor and the same kernel accept queue. Each child builds its
//! own readiness instance and connection table; nothing else is shared.
//! The kernel decides which worker wins each `accept`.

use crate::runtime::error::{Error, Result};
use crate::runtime::socket::ListeningSocket;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use tracing::{error, info, warn};

/// How a worker process ended.
#[derive(Debug, Clone, Copy)]
pub struct WorkerExit {
    pub worker_id: usize,
    pub pid: libc::pid_t,
    pub status: ExitStatus,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} (pid {}) {}",
            self.worker_id, self.pid, self.status
        )
    }
}

/// Fork `count` workers, each running `worker(id, listener)` in its own
/// process, then wait for all of them.
///
/// A child never returns into the caller: it exits with status 0 when
/// `worker` returns `Ok`, 1 when it returns an error and 101 when it
/// panics. Crashed workers are logged, not restarted. Returns once every
/// forked worker has exited.
pub fn spawn_workers<F>(
    listener: ListeningSocket,
    count: usize,
    worker: F,
) -> Result<Vec<WorkerExit>>
where
    F: Fn(usize, ListeningSocket) -> Result<()>,
{
    let mut children: Vec<(usize, libc::pid_t)> = Vec::with_capacity(count);

    for worker_id in 0..count {
        // SAFETY: the child only runs the worker closure and then exits;
        // it never unwinds back into the parent's stack frames.
        match unsafe { libc::fork() } {
            -1 => {
                let err = io::Error::last_os_error();
                if children.is_empty() {
                    return Err(Error::Fork(err));
                }
                error!(
                    worker = worker_id,
                    error = %err,
                    "Fork failed, continuing with fewer workers"
                );
                break;
            }
            0 => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker(worker_id, listener)));
                let code = match outcome {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        error!(worker = worker_id, error = %e, "Worker failed");
                        1
                    }
                    Err(_) => {
                        error!(worker = worker_id, "Worker panicked");
                        101
                    }
                };
                std::process::exit(code);
            }
            pid => {
                info!(worker = worker_id, pid, "Worker spawned");
                children.push((worker_id, pid));
            }
        }
    }

    // The children hold their own copies of the listener.
    drop(listener);

    // Wait for our own children only; the process may have others.
    let mut exits = Vec::with_capacity(children.len());
    for (worker_id, pid) in children {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        while unsafe { libc::waitpid(pid, &mut status, 0) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(Error::Fork(err));
            }
        }

        let exit = WorkerExit {
            worker_id,
            pid,
            status: ExitStatus::from_raw(status),
        };
        if exit.status.success() {
            info!(worker = worker_id, pid, "Worker exited");
        } else {
            warn!(worker = worker_id, pid, status = %exit.status, "Worker exited abnormally");
        }
        exits.push(exit);
    }

    Ok(exits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::Echo;
    use crate::runtime::dispatch::{DispatchSettings, Dispatcher};
    use crate::runtime::mio::MioStrategy;
    use crate::runtime::socket::create_listener;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::os::fd::FromRawFd;
    use std::thread;
    use std::time::{Duration, Instant};

    fn loopback_listener() -> ListeningSocket {
        create_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1024).unwrap()
    }

    /// A `(reader, writer)` pipe.
    fn pipe() -> (File, File) {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: both descriptors were just created and are owned here.
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_workers_are_reaped() {
        let listener = loopback_listener();

        let mut exits = spawn_workers(listener, 4, |worker_id, _listener| match worker_id {
            1 => Err(Error::Wait(io::Error::from_raw_os_error(libc::EBADF))),
            2 => panic!("worker 2 gave up"),
            _ => Ok(()),
        })
        .unwrap();

        exits.sort_by_key(|exit| exit.worker_id);
        assert_eq!(exits.len(), 4);
        assert!(exits[0].status.success());
        assert_eq!(exits[1].status.code(), Some(1));
        assert_eq!(exits[2].status.code(), Some(101));
        assert!(exits[3].status.success());
    }

    #[test]
    fn test_forked_echo_workers_serve_every_client_once() {
        const WORKERS: usize = 4;
        const CLIENTS: usize = 100;
        const IDLE: Duration = Duration::from_secs(1);

        let listener = loopback_listener();
        let addr = listener.local_addr();
        let (mut counts_rx, counts_tx) = pipe();

        // Clients queue up in the backlog until the workers start.
        let clients = thread::spawn(move || {
            let mut streams: Vec<TcpStream> = (0..CLIENTS)
                .map(|i| {
                    let mut stream = TcpStream::connect(addr).unwrap();
                    stream.write_all(&(i as u64).to_be_bytes()).unwrap();
                    stream
                })
                .collect();

            streams
                .iter_mut()
                .enumerate()
                .filter(|(i, stream)| {
                    stream
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    let mut buf = [0u8; 8];
                    (&**stream).read_exact(&mut buf).is_ok() && u64::from_be_bytes(buf) == *i as u64
                })
                .count()
        });

        // Each worker serves until it has been idle for a while, then
        // reports how many connections it accepted.
        let exits = spawn_workers(listener, WORKERS, |worker_id, listener| {
            let mut dispatcher = Dispatcher::new(
                listener,
                MioStrategy::new(256).map_err(Error::SocketCreate)?,
                Echo::default(),
                DispatchSettings::default(),
            )?;

            let mut last_event = Instant::now();
            while last_event.elapsed() < IDLE {
                if dispatcher.turn(Some(Duration::from_millis(10)))? > 0 {
                    last_event = Instant::now();
                }
            }

            let mut record = [0u8; 16];
            record[..8].copy_from_slice(&(worker_id as u64).to_be_bytes());
            record[8..].copy_from_slice(&dispatcher.stats().accepted.to_be_bytes());
            (&counts_tx).write_all(&record).map_err(Error::Fork)
        })
        .unwrap();
        drop(counts_tx);

        assert_eq!(exits.len(), WORKERS);
        assert!(exits.iter().all(|exit| exit.status.success()));
        assert_eq!(clients.join().unwrap(), CLIENTS, "every client gets its own bytes back");

        let mut records = Vec::new();
        counts_rx.read_to_end(&mut records).unwrap();
        assert_eq!(records.len(), 16 * WORKERS);

        let mut seen = Vec::new();
        let mut accepted = 0;
        for record in records.chunks_exact(16) {
            seen.push(u64::from_be_bytes(record[..8].try_into().unwrap()));
            accepted += u64::from_be_bytes(record[8..].try_into().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..WORKERS as u64).collect::<Vec<_>>());
        assert_eq!(accepted, CLIENTS as u64);
    }
}
