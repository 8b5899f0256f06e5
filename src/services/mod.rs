//! Socket-facing services.
//!
//! Currently a single service: the [`control`] Unix-socket server, which
//! accepts local clients, parses their newline-delimited commands, and
//! fans the event ring out to them.

pub mod control;

pub use control::*;
