//! Protocol implementations.
//!
//! Each protocol provides a `Handler` the dispatcher drives with the bytes
//! it reads:
//! - `echo`: write every byte back
//! - `discard`: read until idle, write nothing

pub mod discard;
pub mod echo;

pub use discard::Discard;
pub use echo::Echo;
