//! Huddle wire protocol.
//!
//! A line-oriented text protocol for a single-room chat relay. Clients send
//! [`Command`]s, the server answers with [`ServerLine`]s. Frames are separated
//! by `\n`; legacy peers that send one unterminated command per write are
//! supported by [`FrameSplitter`].
//!
//! This crate is pure: no I/O, no async, no allocation beyond the frames
//! themselves.

#![forbid(unsafe_code)]

mod command;
mod errors;
mod framing;
mod line;

pub use command::Command;
pub use errors::{ProtocolError, Result};
pub use framing::FrameSplitter;
pub use line::{ErrorKind, ServerLine};

/// Default TCP port of the relay.
pub const DEFAULT_PORT: u16 = 42424;
