//! Client-to-server commands.
//!
//! Commands are plain text, one per frame:
//!
//! ```text
//! CONNECT <username>
//! MSG <body>
//! DISCONNECT [username]
//! ```
//!
//! Decoding only looks at the prefix. Whether a command is legal in the
//! current session state is decided by the server's session state machine, not
//! here.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

const CONNECT_PREFIX: &str = "CONNECT ";
const MESSAGE_PREFIX: &str = "MSG ";
const DISCONNECT_PREFIX: &str = "DISCONNECT";

/// Longest slice of an unknown frame echoed back in errors and logs.
const UNKNOWN_PREVIEW_LEN: usize = 32;

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register a handle for this connection.
    Connect {
        /// Requested username, trailing whitespace removed
        username: String,
    },

    /// Publish a chat message.
    Message {
        /// Message body, verbatim
        body: String,
    },

    /// Leave the chat gracefully.
    Disconnect,
}

impl Command {
    /// Decode a single frame.
    ///
    /// The frame must already be stripped of its line terminator (see
    /// [`crate::FrameSplitter`]).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidUtf8` if the frame is not UTF-8
    /// - `ProtocolError::MalformedFrame` for `CONNECT` without a username
    /// - `ProtocolError::UnknownCommand` for any other prefix
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;

        if let Some(rest) = text.strip_prefix(CONNECT_PREFIX) {
            let username = rest.trim_end();
            if username.is_empty() {
                return Err(ProtocolError::MalformedFrame("CONNECT requires a username"));
            }
            return Ok(Self::Connect { username: username.to_string() });
        }

        if text.trim_end() == CONNECT_PREFIX.trim_end() {
            return Err(ProtocolError::MalformedFrame("CONNECT requires a username"));
        }

        if let Some(body) = text.strip_prefix(MESSAGE_PREFIX) {
            return Ok(Self::Message { body: body.to_string() });
        }

        if text.starts_with(DISCONNECT_PREFIX) {
            return Ok(Self::Disconnect);
        }

        Err(ProtocolError::UnknownCommand(preview(text)))
    }

    /// Encode this command as one newline-terminated frame.
    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::Connect { username } => {
                dst.put_slice(CONNECT_PREFIX.as_bytes());
                dst.put_slice(username.as_bytes());
            },
            Self::Message { body } => {
                dst.put_slice(MESSAGE_PREFIX.as_bytes());
                dst.put_slice(body.as_bytes());
            },
            Self::Disconnect => dst.put_slice(DISCONNECT_PREFIX.as_bytes()),
        }
        dst.put_u8(b'\n');
    }

    /// Encode into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

fn preview(text: &str) -> String {
    text.chars().take(UNKNOWN_PREVIEW_LEN).collect()
}
