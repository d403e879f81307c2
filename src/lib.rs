//! qsvbridge - asynchronous front-end for Quick Sync decode sessions.
//!
//! The session layer itself lives in [`qsvbridge_codec`] and is re-exported
//! here as [`codec`]. This crate adds:
//!
//! - [`parallel`]: a tokio service that lets many tasks share one decode
//!   session while keeping results in submission order
//! - the `qsv-sim` binary, which runs an encode/decode round trip on the
//!   software reference device

pub mod parallel;

pub use qsvbridge_codec as codec;

pub use parallel::{DecodeWorker, ParallelDecoder, SequenceBarrier};
