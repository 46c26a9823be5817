//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Users and history survive server restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{ChatMessage, Storage, StorageError, UserRecord};
use crate::env::Timestamp;

/// Table: users
/// Key: username
/// Value: CBOR-encoded `UserRecord`
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Table: messages
/// Key: (timestamp: u64, seq: u64) as big-endian bytes [16 bytes]
/// Value: CBOR-encoded `ChatMessage`
///
/// `seq` orders messages sharing a timestamp by append order.
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates the tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(StorageError::io)?;

        let txn = db.begin_write().map_err(StorageError::io)?;
        {
            let _ = txn.open_table(USERS).map_err(StorageError::io)?;
            let _ = txn.open_table(MESSAGES).map_err(StorageError::io)?;
        }
        txn.commit().map_err(StorageError::io)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Walk a range of the messages table backwards keeping at most `limit`
    /// rows, and return them oldest-first.
    fn collect_newest(
        rows: redb::Range<'_, &'static [u8], &'static [u8]>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let mut messages = Vec::with_capacity(limit.min(64));
        for row in rows.rev().take(limit) {
            let (_, value) = row.map_err(StorageError::io)?;
            messages.push(decode(value.value())?);
        }
        messages.reverse();
        Ok(messages)
    }
}

impl Storage for RedbStorage {
    fn touch_user(&self, username: &str, connected_at: Timestamp) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(StorageError::io)?;

        {
            let mut table = txn.open_table(USERS).map_err(StorageError::io)?;

            let existing: Option<UserRecord> = table
                .get(username)
                .map_err(StorageError::io)?
                .map(|value| decode(value.value()))
                .transpose()?;

            let record = match existing {
                Some(user) => UserRecord { connected_at, disconnected_at: None, ..user },
                None => UserRecord {
                    username: username.to_string(),
                    connected_at,
                    disconnected_at: None,
                },
            };

            let bytes = encode(&record)?;
            table.insert(username, bytes.as_slice()).map_err(StorageError::io)?;
        }

        txn.commit().map_err(StorageError::io)?;

        Ok(())
    }

    fn mark_disconnected(
        &self,
        username: &str,
        disconnected_at: Timestamp,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(StorageError::io)?;

        {
            let mut table = txn.open_table(USERS).map_err(StorageError::io)?;

            let existing: Option<UserRecord> = table
                .get(username)
                .map_err(StorageError::io)?
                .map(|value| decode(value.value()))
                .transpose()?;

            let Some(mut record) = existing else {
                return Err(StorageError::UserNotFound(username.to_string()));
            };
            record.disconnected_at = Some(disconnected_at);

            let bytes = encode(&record)?;
            table.insert(username, bytes.as_slice()).map_err(StorageError::io)?;
        }

        txn.commit().map_err(StorageError::io)?;

        Ok(())
    }

    fn load_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::io)?;
        let table = txn.open_table(USERS).map_err(StorageError::io)?;

        table.get(username).map_err(StorageError::io)?.map(|value| decode(value.value())).transpose()
    }

    fn append_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(StorageError::io)?;

        {
            let mut table = txn.open_table(MESSAGES).map_err(StorageError::io)?;

            let first = message_key(message.timestamp, 0);
            let last = message_key(message.timestamp, u64::MAX);
            let seq = match table
                .range(first.as_slice()..=last.as_slice())
                .map_err(StorageError::io)?
                .next_back()
            {
                Some(row) => {
                    let (key, _) = row.map_err(StorageError::io)?;
                    let (_, seq) = decode_message_key(key.value())?;
                    seq.saturating_add(1)
                },
                None => 0,
            };

            let key = message_key(message.timestamp, seq);
            let bytes = encode(message)?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(StorageError::io)?;
        }

        txn.commit().map_err(StorageError::io)?;

        Ok(())
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::io)?;
        let table = txn.open_table(MESSAGES).map_err(StorageError::io)?;

        Self::collect_newest(table.iter().map_err(StorageError::io)?, limit)
    }

    fn messages_until(
        &self,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::io)?;
        let table = txn.open_table(MESSAGES).map_err(StorageError::io)?;

        let end = message_key(until, u64::MAX);
        Self::collect_newest(table.range(..=end.as_slice()).map_err(StorageError::io)?, limit)
    }

    fn messages_after(&self, after: Timestamp) -> Result<Vec<ChatMessage>, StorageError> {
        let Some(from) = after.as_micros().checked_add(1) else {
            return Ok(Vec::new());
        };

        let txn = self.db.begin_read().map_err(StorageError::io)?;
        let table = txn.open_table(MESSAGES).map_err(StorageError::io)?;

        let start = message_key(Timestamp::from_micros(from), 0);
        let mut messages = Vec::new();
        for row in table.range(start.as_slice()..).map_err(StorageError::io)? {
            let (_, value) = row.map_err(StorageError::io)?;
            messages.push(decode(value.value())?);
        }

        Ok(messages)
    }

    fn latest_timestamp(&self) -> Result<Option<Timestamp>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::io)?;

        let messages = txn.open_table(MESSAGES).map_err(StorageError::io)?;
        let mut latest = match messages.last().map_err(StorageError::io)? {
            Some((key, _)) => Some(decode_message_key(key.value())?.0),
            None => None,
        };

        let users = txn.open_table(USERS).map_err(StorageError::io)?;
        for row in users.iter().map_err(StorageError::io)? {
            let (_, value) = row.map_err(StorageError::io)?;
            let user: UserRecord = decode(value.value())?;
            let seen = user.disconnected_at.map_or(user.connected_at, |d| d.max(user.connected_at));
            latest = latest.max(Some(seen));
        }

        Ok(latest)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(StorageError::serialization)?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(StorageError::serialization)
}

/// Encode message key: timestamp (8 bytes BE) + seq (8 bytes BE)
fn message_key(timestamp: Timestamp, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..8].copy_from_slice(&timestamp.as_micros().to_be_bytes());
    key[8..16].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Decode message key to (timestamp, seq)
fn decode_message_key(key: &[u8]) -> Result<(Timestamp, u64), StorageError> {
    let malformed =
        || StorageError::Serialization(format!("malformed message key ({} bytes)", key.len()));

    let (timestamp, rest) = key.split_first_chunk::<8>().ok_or_else(malformed)?;
    let seq = rest.first_chunk::<8>().ok_or_else(malformed)?;

    Ok((Timestamp::from_micros(u64::from_be_bytes(*timestamp)), u64::from_be_bytes(*seq)))
}
