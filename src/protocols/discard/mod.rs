//! Discard protocol.
//!
//! Reads until the socket is idle and throws the data away. Nothing is
//! ever written, so only the read side of the dispatch path is exercised.

pub mod handler;

pub use handler::Discard;
