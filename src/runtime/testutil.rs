//! Loopback socket helpers shared by the runtime tests.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on.
pub const DEADLINE: Duration = Duration::from_secs(5);

/// A connected `(client, server)` pair. The server side is non-blocking.
pub fn stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (client, server)
}

/// Poll `done` until it returns true, failing the test after `DEADLINE`.
pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Run `body` in a forked child and return its exit code.
///
/// For tests that change process-wide state such as resource limits. A
/// panic in the child exits with 101.
pub fn in_child(body: impl FnOnce() -> i32) -> i32 {
    // SAFETY: the child runs `body` and leaves through `_exit`; it never
    // returns into the test harness.
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", io::Error::last_os_error()),
        0 => {
            let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(101);
            // SAFETY: terminates the child without running the parent's
            // atexit handlers.
            unsafe { libc::_exit(code) }
        }
        pid => {
            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer.
            while unsafe { libc::waitpid(pid, &mut status, 0) } != pid {
                let err = io::Error::last_os_error();
                assert_eq!(err.kind(), io::ErrorKind::Interrupted, "waitpid: {err}");
            }
            ExitStatus::from_raw(status).code().unwrap_or(-1)
        }
    }
}
