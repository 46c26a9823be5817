//! Client error types.

use huddle_proto::ErrorKind;
use thiserror::Error;

/// Errors from [`crate::ChatClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server answered with an error line and closed the connection.
    #[error("rejected by server: {}", .0.as_str())]
    Rejected(ErrorKind),

    /// Server closed the connection before registration completed.
    #[error("server closed the connection during registration")]
    ClosedDuringRegistration,

    /// Username cannot be sent as a single `CONNECT` frame, or would be
    /// indistinguishable from a chat line in server notices.
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    /// Message body cannot be sent as a single `MSG` frame.
    #[error("message must be a single line")]
    MultilineMessage,
}
