//! Protocol error types.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while turning raw frames into commands.
///
/// Every variant is fatal for the session that produced it, but never for the
/// server: the peer receives one error line and is disconnected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame bytes are not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// Frame carried a known command with an unusable argument.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Frame does not start with any known command.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// Frame grew past the configured limit without a terminator.
    #[error("frame too large: {size} bytes exceeds {max}")]
    FrameTooLarge {
        /// Bytes buffered so far
        size: usize,
        /// Configured limit
        max: usize,
    },
}
