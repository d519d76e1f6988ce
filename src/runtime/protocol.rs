//! Per-connection payload handling.
//!
//! The dispatcher owns all I/O. A handler only sees bytes that were read
//! and appends bytes to be written, so its cost stays out of the
//! multiplexing measurement.

use crate::runtime::connection::Connection;
use bytes::BytesMut;
use std::os::unix::io::RawFd;

/// Protocol type served on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Write back every byte read.
    Echo,
    /// Read until idle and drop the data.
    Discard,
}

/// Opaque per-connection handler driven by the dispatcher.
pub trait Handler {
    /// Consume bytes from `input` and append any reply to `output`.
    ///
    /// Bytes left in `input` are kept and offered again with the next read.
    fn on_data(&mut self, fd: RawFd, input: &mut BytesMut, output: &mut BytesMut);

    /// Called after the connection is deregistered, before it is closed.
    fn on_close(&mut self, _conn: &Connection) {}
}
