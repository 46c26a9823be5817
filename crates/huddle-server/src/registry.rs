//! Registry of active sessions.
//!
//! Maintains two maps under one lock: session → (username, outbound handle)
//! for fan-out, and username → session for the uniqueness check. Registering
//! checks and inserts in a single critical section, so two concurrent
//! `CONNECT dave` can never both succeed.
//!
//! Only currently active names are exclusive. Once a session unregisters, its
//! username is free again.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

/// Server-assigned identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors from [`SessionRegistry::try_register`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Another active session holds this username
    #[error("username {0:?} is already taken")]
    NameTaken(String),

    /// This session already registered under some username
    #[error("session {0} is already registered")]
    SessionAlreadyRegistered(SessionId),
}

/// Outcome of queueing bytes for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the session's writer
    Queued,
    /// Queue is full; the recipient is not keeping up
    Full,
    /// Writer is gone; the session is tearing down
    Closed,
}

/// Sending side of one session's outbound path.
///
/// Cloned into the registry so the hub can queue bytes without touching the
/// session's transport. Queueing never blocks.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Bytes>,
    kick: Arc<Notify>,
}

impl SessionHandle {
    /// Create a handle over a bounded outbound queue and a teardown signal.
    pub fn new(outbound: mpsc::Sender<Bytes>, kick: Arc<Notify>) -> Self {
        Self { outbound, kick }
    }

    /// Queue bytes for the session's writer without waiting.
    pub fn deliver(&self, bytes: Bytes) -> Delivery {
        match self.outbound.try_send(bytes) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ask the session to tear itself down.
    ///
    /// The permit is stored, so a kick sent before the session starts waiting
    /// is not lost.
    pub fn kick(&self) {
        self.kick.notify_one();
    }
}

/// A registered session as seen by the hub during fan-out.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Session identity
    pub id: SessionId,
    /// Registered username
    pub username: String,
    /// Outbound path
    pub handle: SessionHandle,
}

#[derive(Debug)]
struct Entry {
    username: String,
    handle: SessionHandle,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Entry>,
    usernames: HashMap<String, SessionId>,
}

/// Concurrency-safe map of active sessions.
///
/// Every method takes the lock for the duration of a map operation only, and
/// never across I/O. A poisoned lock is recovered: each mutation updates both
/// maps before it can panic.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `username` for session `id`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NameTaken` if an active session holds `username`
    /// - `RegistryError::SessionAlreadyRegistered` if `id` is already in the
    ///   registry
    pub fn try_register(
        &self,
        id: SessionId,
        username: &str,
        handle: SessionHandle,
    ) -> Result<(), RegistryError> {
        let mut inner = self.write();

        if inner.sessions.contains_key(&id) {
            return Err(RegistryError::SessionAlreadyRegistered(id));
        }
        if inner.usernames.contains_key(username) {
            return Err(RegistryError::NameTaken(username.to_string()));
        }

        inner.usernames.insert(username.to_string(), id);
        inner.sessions.insert(id, Entry { username: username.to_string(), handle });
        Ok(())
    }

    /// Remove the session, returning its username.
    ///
    /// Idempotent: `None` if the session never registered or was already
    /// removed.
    pub fn unregister(&self, id: SessionId) -> Option<String> {
        let mut inner = self.write();
        let entry = inner.sessions.remove(&id)?;
        inner.usernames.remove(&entry.username);
        Some(entry.username)
    }

    /// Point-in-time view of all active sessions, ordered by id.
    pub fn snapshot(&self) -> Vec<Recipient> {
        let inner = self.read();
        let mut recipients: Vec<Recipient> = inner
            .sessions
            .iter()
            .map(|(id, entry)| Recipient {
                id: *id,
                username: entry.username.clone(),
                handle: entry.handle.clone(),
            })
            .collect();
        recipients.sort_by_key(|r| r.id);
        recipients
    }

    /// Username held by a session. `None` if not registered.
    pub fn username_of(&self, id: SessionId) -> Option<String> {
        self.read().sessions.get(&id).map(|entry| entry.username.clone())
    }

    /// Check if a username is held by an active session.
    pub fn is_active(&self, username: &str) -> bool {
        self.read().usernames.contains_key(username)
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    /// Check if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
