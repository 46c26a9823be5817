//! Persistence port for users and chat history.
//!
//! Trait-based abstraction so the hub can run against a durable database in
//! production and an in-memory map in tests. The trait is synchronous: the hub
//! calls it from inside its ordering section, which never awaits.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;
use crate::env::Timestamp;

/// A user that has registered at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Unique key
    pub username: String,
    /// Start of the most recent session
    pub connected_at: Timestamp,
    /// End of the most recent session. `None` while a session is active or if
    /// the server stopped before recording it.
    pub disconnected_at: Option<Timestamp>,
}

/// A persisted chat message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author
    pub username: String,
    /// Body, verbatim
    pub body: String,
    /// Stamp assigned by the hub at acceptance time
    pub timestamp: Timestamp,
}

impl ChatMessage {
    /// Build a message.
    pub fn new(username: impl Into<String>, body: impl Into<String>, timestamp: Timestamp) -> Self {
        Self { username: username.into(), body: body.into(), timestamp }
    }
}

/// Storage abstraction for users and chat history
///
/// Must be Clone (shared by the hub and the runtime), Send + Sync, and
/// synchronous. Implementations share internal state via Arc, so clones access
/// the same underlying storage.
///
/// Every query returning messages returns them oldest-first. Messages with
/// equal timestamps keep their append order.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Create the user if unknown, then record a new session start.
    ///
    /// # Invariants
    ///
    /// - Post: `connected_at` is updated and `disconnected_at` is `None`
    fn touch_user(&self, username: &str, connected_at: Timestamp) -> Result<(), StorageError>;

    /// Record the end of the user's current session.
    ///
    /// # Errors
    ///
    /// `StorageError::UserNotFound` if the user was never touched.
    fn mark_disconnected(
        &self,
        username: &str,
        disconnected_at: Timestamp,
    ) -> Result<(), StorageError>;

    /// Load a user record. `None` for first-time users.
    fn load_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError>;

    /// Append a message to the history.
    fn append_message(&self, message: &ChatMessage) -> Result<(), StorageError>;

    /// The newest `limit` messages.
    fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StorageError>;

    /// The newest `limit` messages stamped at or before `until`.
    fn messages_until(
        &self,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError>;

    /// All messages stamped strictly after `after`.
    fn messages_after(&self, after: Timestamp) -> Result<Vec<ChatMessage>, StorageError>;

    /// Largest timestamp recorded anywhere in the store, for messages and
    /// user sessions alike. `None` for an empty store.
    fn latest_timestamp(&self) -> Result<Option<Timestamp>, StorageError>;

    /// Recent history up to the user's last disconnect.
    ///
    /// Users without a recorded disconnect (first-time users, or a session cut
    /// short by a crash) get the newest `limit` messages unconditionally.
    fn messages_up_to_disconnect(
        &self,
        username: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        match self.load_user(username)?.and_then(|user| user.disconnected_at) {
            Some(disconnected_at) => self.messages_until(disconnected_at, limit),
            None => self.recent_messages(limit),
        }
    }

    /// Messages the user missed since their last disconnect. Empty without a
    /// recorded disconnect.
    fn messages_since_disconnect(&self, username: &str) -> Result<Vec<ChatMessage>, StorageError> {
        match self.load_user(username)?.and_then(|user| user.disconnected_at) {
            Some(disconnected_at) => self.messages_after(disconnected_at),
            None => Ok(Vec::new()),
        }
    }
}
