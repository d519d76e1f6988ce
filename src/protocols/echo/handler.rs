//! Echo handler.

use crate::runtime::{Connection, Handler};
use bytes::BytesMut;
use std::os::unix::io::RawFd;
use tracing::trace;

/// Writes back everything it reads.
#[derive(Debug, Default)]
pub struct Echo {
    /// Total bytes echoed across all connections.
    pub bytes: u64,
    /// Number of `on_data` calls.
    pub chunks: u64,
}

impl Handler for Echo {
    fn on_data(&mut self, _fd: RawFd, input: &mut BytesMut, output: &mut BytesMut) {
        self.bytes += input.len() as u64;
        self.chunks += 1;
        output.extend_from_slice(input);
        input.clear();
    }

    fn on_close(&mut self, conn: &Connection) {
        trace!(fd = conn.fd(), echoed = conn.bytes_written, "Echo session finished");
    }
}
