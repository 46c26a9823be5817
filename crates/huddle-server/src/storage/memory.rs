use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{ChatMessage, Storage, StorageError, UserRecord};
use crate::env::Timestamp;

/// In-memory storage implementation for tests and `--in-memory` runs
///
/// Users live in a `HashMap`, messages in a Vec kept in timestamp order. All
/// state is wrapped in Arc<Mutex<>> to allow Clone and concurrent access. A
/// poisoned lock is recovered, since every operation leaves the maps
/// consistent before it can panic.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    users: HashMap<String, UserRecord>,

    /// Sorted by timestamp; equal stamps in append order
    messages: Vec<ChatMessage>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Number of known users.
    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn newest(messages: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    let start = messages.len().saturating_sub(limit);
    messages[start..].to_vec()
}

impl Storage for MemoryStorage {
    fn touch_user(&self, username: &str, connected_at: Timestamp) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner
            .users
            .entry(username.to_string())
            .and_modify(|user| {
                user.connected_at = connected_at;
                user.disconnected_at = None;
            })
            .or_insert_with(|| UserRecord {
                username: username.to_string(),
                connected_at,
                disconnected_at: None,
            });
        Ok(())
    }

    fn mark_disconnected(
        &self,
        username: &str,
        disconnected_at: Timestamp,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(username)
            .ok_or_else(|| StorageError::UserNotFound(username.to_string()))?;
        user.disconnected_at = Some(disconnected_at);
        Ok(())
    }

    fn load_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.lock().users.get(username).cloned())
    }

    fn append_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let at = inner.messages.partition_point(|m| m.timestamp <= message.timestamp);
        inner.messages.insert(at, message.clone());
        Ok(())
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StorageError> {
        Ok(newest(&self.lock().messages, limit))
    }

    fn messages_until(
        &self,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let inner = self.lock();
        let end = inner.messages.partition_point(|m| m.timestamp <= until);
        Ok(newest(&inner.messages[..end], limit))
    }

    fn messages_after(&self, after: Timestamp) -> Result<Vec<ChatMessage>, StorageError> {
        let inner = self.lock();
        let start = inner.messages.partition_point(|m| m.timestamp <= after);
        Ok(inner.messages[start..].to_vec())
    }

    fn latest_timestamp(&self) -> Result<Option<Timestamp>, StorageError> {
        let inner = self.lock();
        let from_messages = inner.messages.last().map(|m| m.timestamp);
        let from_users = inner
            .users
            .values()
            .map(|u| u.disconnected_at.map_or(u.connected_at, |d| d.max(u.connected_at)))
            .max();
        Ok(from_messages.max(from_users))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(micros: u64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn bodies(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.body.as_str()).collect()
    }

    fn seeded(count: u64) -> MemoryStorage {
        let storage = MemoryStorage::new();
        for i in 1..=count {
            storage.append_message(&ChatMessage::new("alice", format!("m{i}"), ts(i * 10))).unwrap();
        }
        storage
    }

    #[test]
    fn recent_messages_are_newest_oldest_first() {
        let storage = seeded(5);
        assert_eq!(bodies(&storage.recent_messages(3).unwrap()), vec!["m3", "m4", "m5"]);
        assert_eq!(storage.recent_messages(100).unwrap().len(), 5);
        assert!(storage.recent_messages(0).unwrap().is_empty());
    }

    #[test]
    fn out_of_order_append_is_sorted() {
        let storage = MemoryStorage::new();
        storage.append_message(&ChatMessage::new("a", "late", ts(30))).unwrap();
        storage.append_message(&ChatMessage::new("a", "early", ts(10))).unwrap();
        storage.append_message(&ChatMessage::new("a", "tie", ts(30))).unwrap();

        assert_eq!(bodies(&storage.recent_messages(10).unwrap()), vec!["early", "late", "tie"]);
    }

    #[test]
    fn until_is_inclusive_and_after_is_exclusive() {
        let storage = seeded(5);

        assert_eq!(bodies(&storage.messages_until(ts(30), 2).unwrap()), vec!["m2", "m3"]);
        assert_eq!(bodies(&storage.messages_after(ts(30)).unwrap()), vec!["m4", "m5"]);
        assert!(storage.messages_after(ts(50)).unwrap().is_empty());
        assert!(storage.messages_until(ts(5), 20).unwrap().is_empty());
    }

    #[test]
    fn touch_clears_disconnect() {
        let storage = MemoryStorage::new();
        storage.touch_user("carol", ts(1)).unwrap();
        storage.mark_disconnected("carol", ts(2)).unwrap();
        assert_eq!(storage.load_user("carol").unwrap().unwrap().disconnected_at, Some(ts(2)));

        storage.touch_user("carol", ts(3)).unwrap();
        let user = storage.load_user("carol").unwrap().unwrap();
        assert_eq!(user.connected_at, ts(3));
        assert_eq!(user.disconnected_at, None);
        assert_eq!(storage.user_count(), 1);
    }

    #[test]
    fn mark_disconnected_requires_user() {
        let storage = MemoryStorage::new();
        assert_eq!(
            storage.mark_disconnected("ghost", ts(1)),
            Err(StorageError::UserNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn disconnect_windows() {
        let storage = seeded(4);
        storage.touch_user("carol", ts(1)).unwrap();
        storage.mark_disconnected("carol", ts(25)).unwrap();

        let recent = storage.messages_up_to_disconnect("carol", 20).unwrap();
        assert_eq!(bodies(&recent), vec!["m1", "m2"]);
        assert_eq!(bodies(&storage.messages_since_disconnect("carol").unwrap()), vec!["m3", "m4"]);

        // First-time user: unconditional recent history, no unread phase
        assert_eq!(storage.messages_up_to_disconnect("newbie", 2).unwrap().len(), 2);
        assert!(storage.messages_since_disconnect("newbie").unwrap().is_empty());
    }

    #[test]
    fn latest_timestamp_covers_users_and_messages() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.latest_timestamp().unwrap(), None);

        storage.append_message(&ChatMessage::new("a", "x", ts(10))).unwrap();
        storage.touch_user("a", ts(5)).unwrap();
        assert_eq!(storage.latest_timestamp().unwrap(), Some(ts(10)));

        storage.mark_disconnected("a", ts(40)).unwrap();
        assert_eq!(storage.latest_timestamp().unwrap(), Some(ts(40)));
    }

    #[test]
    fn clones_share_state() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();
        clone.append_message(&ChatMessage::new("a", "x", ts(1))).unwrap();
        assert_eq!(storage.message_count(), 1);
    }
}
