//! Discard handler.

use crate::runtime::{Connection, Handler};
use bytes::BytesMut;
use std::os::unix::io::RawFd;
use tracing::trace;

/// Counts and drops everything it reads.
#[derive(Debug, Default)]
pub struct Discard {
    /// Total bytes discarded across all connections.
    pub bytes: u64,
    /// Number of `on_data` calls.
    pub chunks: u64,
}

impl Handler for Discard {
    fn on_data(&mut self, _fd: RawFd, input: &mut BytesMut, _output: &mut BytesMut) {
        self.bytes += input.len() as u64;
        self.chunks += 1;
        input.clear();
    }

    fn on_close(&mut self, conn: &Connection) {
        trace!(fd = conn.fd(), discarded = conn.bytes_read, "Discard session finished");
    }
}
