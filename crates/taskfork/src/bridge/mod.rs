//! Wire layer shared by the controller and the worker.
//!
//! # Architecture
//!
//! - **protocol**: frame types and the reserved control-signal ids
//! - **codec**: binary framing for `FramedRead`/`FramedWrite`
//! - **blocking**: the same codecs driven over `std::io` streams

pub mod blocking;
pub mod codec;
pub mod protocol;
