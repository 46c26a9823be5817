//! Server-to-client lines.
//!
//! Everything the server writes is a single line of text terminated by `\n`:
//! relayed chat (`alice: hello`), presence notices (`alice has joined the
//! chat.`), free-form notices, and rejections (`ERROR: ...`). Rejections are
//! always followed by the server closing the connection.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

const JOINED_SUFFIX: &str = " has joined the chat.";
const LEFT_SUFFIX: &str = " has left the chat.";
const CHAT_SEPARATOR: &str = ": ";

/// Rejection sent right before the server closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another active session already holds the requested username.
    UsernameTaken,
    /// The frame could not be understood in the session's current state.
    UnknownProtocol,
}

impl ErrorKind {
    /// Wire text, including the `ERROR: ` prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UsernameTaken => "ERROR: Username already taken.",
            Self::UnknownProtocol => "ERROR: Unknown protocol.",
        }
    }

    fn from_wire(line: &str) -> Option<Self> {
        [Self::UsernameTaken, Self::UnknownProtocol].into_iter().find(|kind| kind.as_str() == line)
    }
}

/// A line sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// Relayed chat message.
    Chat {
        /// Author of the message
        username: String,
        /// Message body
        body: String,
    },

    /// A user completed registration.
    Joined {
        /// User who joined
        username: String,
    },

    /// A registered user went away.
    Left {
        /// User who left
        username: String,
    },

    /// Free-form system notice (e.g. shutdown).
    Notice(String),

    /// Rejection, followed by connection close.
    Error(ErrorKind),
}

impl ServerLine {
    /// Build a chat line.
    pub fn chat(username: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Chat { username: username.into(), body: body.into() }
    }

    /// Build a join notice.
    pub fn joined(username: impl Into<String>) -> Self {
        Self::Joined { username: username.into() }
    }

    /// Build a leave notice.
    pub fn left(username: impl Into<String>) -> Self {
        Self::Left { username: username.into() }
    }

    /// Append the wire form (text plus `\n`) to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::Chat { username, body } => {
                dst.put_slice(username.as_bytes());
                dst.put_slice(CHAT_SEPARATOR.as_bytes());
                dst.put_slice(body.as_bytes());
            },
            Self::Joined { username } => {
                dst.put_slice(username.as_bytes());
                dst.put_slice(JOINED_SUFFIX.as_bytes());
            },
            Self::Left { username } => {
                dst.put_slice(username.as_bytes());
                dst.put_slice(LEFT_SUFFIX.as_bytes());
            },
            Self::Notice(text) => dst.put_slice(text.as_bytes()),
            Self::Error(kind) => dst.put_slice(kind.as_str().as_bytes()),
        }
        dst.put_u8(b'\n');
    }

    /// Wire form as shareable bytes, so one encoding can be fanned out to
    /// many sessions.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Classify a received line (terminator already removed).
    ///
    /// The text protocol is ambiguous for adversarial usernames, so this is a
    /// best-effort parse: exact error texts first, then presence notices, then
    /// chat lines, and anything else is a plain notice.
    pub fn parse(line: &str) -> Self {
        if let Some(kind) = ErrorKind::from_wire(line) {
            return Self::Error(kind);
        }

        if let Some(username) = line.strip_suffix(JOINED_SUFFIX)
            && !username.contains(CHAT_SEPARATOR)
        {
            return Self::joined(username);
        }

        if let Some(username) = line.strip_suffix(LEFT_SUFFIX)
            && !username.contains(CHAT_SEPARATOR)
        {
            return Self::left(username);
        }

        match line.split_once(CHAT_SEPARATOR) {
            Some((username, body)) => Self::chat(username, body),
            None => Self::Notice(line.to_string()),
        }
    }
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat { username, body } => write!(f, "{username}{CHAT_SEPARATOR}{body}"),
            Self::Joined { username } => write!(f, "{username}{JOINED_SUFFIX}"),
            Self::Left { username } => write!(f, "{username}{LEFT_SUFFIX}"),
            Self::Notice(text) => f.write_str(text),
            Self::Error(kind) => f.write_str(kind.as_str()),
        }
    }
}
