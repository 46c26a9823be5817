//! Session state machine.
//!
//! Decides what each decoded frame means for one connection. Uses the action
//! pattern: [`Session::handle`] takes a decoded command and returns a
//! [`SessionAction`] for the supervisor to execute. No I/O happens here.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐  CONNECT + registered  ┌────────┐
//! │ Unregistered │───────────────────────>│ Active │<──┐ MSG
//! └──────────────┘                        └────────┘───┘
//!        │                                     │
//!        │ anything else / name taken          │ DISCONNECT / EOF / error
//!        ↓                                     ↓
//!   ┌────────┐                            ┌────────┐
//!   │ Closed │                            │ Closed │
//!   └────────┘                            └────────┘
//! ```

use huddle_proto::{Command, ErrorKind, ProtocolError};
use thiserror::Error;

use crate::registry::SessionId;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no username yet
    Unregistered,
    /// Registered and receiving broadcasts
    Active,
    /// Terminal
    Closed,
}

/// Actions returned by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Try to claim the username and admit the session
    Register {
        /// Requested username
        username: String,
    },

    /// Broadcast a chat message from this session
    Publish {
        /// Message body, verbatim
        body: String,
    },

    /// Leave gracefully; the session is now closed
    Leave,

    /// Send this error line and close; the session is now closed
    Reject(ErrorKind),

    /// Nothing to do
    Ignore,
}

/// Invalid use of the state machine by its driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `activate` called outside `Unregistered`
    #[error("cannot activate session in state {0:?}")]
    InvalidTransition(SessionState),
}

/// Per-connection protocol state.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    username: Option<String>,
    /// Whether `close` already reported the departure
    departed: bool,
}

impl Session {
    /// New session in `Unregistered`.
    pub fn new(id: SessionId) -> Self {
        Self { id, state: SessionState::Unregistered, username: None, departed: false }
    }

    /// Session identity.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Registered username. `None` until activated.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Decide what a decoded frame means in the current state.
    ///
    /// `Leave` and `Reject` move the session to `Closed`. Frames arriving in
    /// `Closed` are ignored.
    pub fn handle(&mut self, decoded: Result<Command, ProtocolError>) -> SessionAction {
        match (self.state, decoded) {
            (SessionState::Closed, _) => SessionAction::Ignore,

            (SessionState::Unregistered, Ok(Command::Connect { username })) => {
                SessionAction::Register { username }
            },

            (SessionState::Active, Ok(Command::Message { body })) => {
                if body.trim().is_empty() {
                    SessionAction::Ignore
                } else {
                    SessionAction::Publish { body }
                }
            },

            (SessionState::Active, Ok(Command::Disconnect)) => {
                self.state = SessionState::Closed;
                SessionAction::Leave
            },

            // Unregistered sessions may only CONNECT; active ones may not
            // CONNECT again. Undecodable frames land here too.
            (SessionState::Unregistered | SessionState::Active, _) => {
                self.state = SessionState::Closed;
                SessionAction::Reject(ErrorKind::UnknownProtocol)
            },
        }
    }

    /// Record a successful registration.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidTransition` unless the session is `Unregistered`.
    pub fn activate(&mut self, username: String) -> Result<(), SessionError> {
        if self.state != SessionState::Unregistered {
            return Err(SessionError::InvalidTransition(self.state));
        }

        self.state = SessionState::Active;
        self.username = Some(username);
        Ok(())
    }

    /// Move to `Closed`.
    ///
    /// Returns the username the first time a session that reached `Active` is
    /// closed, and `None` on every later call. The caller announces the
    /// departure exactly when this returns `Some`.
    pub fn close(&mut self) -> Option<String> {
        self.state = SessionState::Closed;

        if self.departed {
            return None;
        }
        let username = self.username.clone()?;
        self.departed = true;
        Some(username)
    }
}
