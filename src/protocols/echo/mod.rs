//! Echo protocol.
//!
//! Every byte read from a connection is written back unchanged, in order.
//! There is no framing: the stream is opaque, so what is being measured is
//! the cost of moving bytes through the dispatcher.
//!
//! ## Use Cases
//!
//! 1. **Throughput testing**: raw bytes in, raw bytes out.
//!
//! 2. **Correctness validation**: a client can compare what it sent with
//!    what it got back; any loss or duplication in the dispatch path shows
//!    up as a mismatch.

pub mod handler;

pub use handler::Echo;
