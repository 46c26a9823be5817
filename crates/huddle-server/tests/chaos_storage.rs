//! Chaos tests for storage and the hub
//!
//! Storage wrapped in `ChaoticStorage` must keep its ordering contract for
//! every write that reported success, and the hub must keep delivering live
//! messages no matter how often persistence fails.

use std::sync::Arc;

use bytes::Bytes;
use huddle_server::{
    BroadcastHub, ChaoticStorage, ChatMessage, ManualEnv, MemoryStorage, RedbStorage,
    SessionHandle, SessionId, Storage, Timestamp,
};
use proptest::prelude::*;
use tempfile::tempdir;
use tokio::sync::{Notify, mpsc};

/// Check that a query result is oldest-first.
fn assert_chronological(messages: &[ChatMessage]) {
    for pair in messages.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp, "out of order: {pair:?}");
    }
}

fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<String> {
    let mut text = String::new();
    while let Ok(chunk) = rx.try_recv() {
        text.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    text.lines().map(str::to_string).collect()
}

#[test]
fn prop_storage_chaos_keeps_successful_appends() {
    proptest!(|(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        stamps in prop::collection::vec(0u64..1_000, 1..80),
    )| {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);

        let mut stored = Vec::new();
        for (i, stamp) in stamps.iter().enumerate() {
            let message = ChatMessage::new("alice", format!("m{i}"), Timestamp::from_micros(*stamp));
            if storage.append_message(&message).is_ok() {
                stored.push(message);
            }
        }

        // Stable sort: equal stamps keep append order
        stored.sort_by_key(|m| m.timestamp);
        let all = storage.inner().recent_messages(usize::MAX).unwrap();
        prop_assert_eq!(&all, &stored);

        if let Ok(recent) = storage.recent_messages(10) {
            assert_chronological(&recent);
            prop_assert_eq!(recent.as_slice(), &stored[stored.len().saturating_sub(10)..]);
        }
    });
}

#[test]
fn prop_disconnect_windows_partition_history() {
    proptest!(|(
        stamps in prop::collection::vec(1u64..1_000, 0..60),
        disconnected_at in 0u64..1_000,
        limit in 1usize..30,
    )| {
        let storage = MemoryStorage::new();
        for (i, stamp) in stamps.iter().enumerate() {
            storage
                .append_message(&ChatMessage::new("bob", format!("m{i}"), Timestamp::from_micros(*stamp)))
                .unwrap();
        }
        storage.touch_user("carol", Timestamp::ZERO).unwrap();
        storage.mark_disconnected("carol", Timestamp::from_micros(disconnected_at)).unwrap();

        let recent = storage.messages_up_to_disconnect("carol", limit).unwrap();
        let unread = storage.messages_since_disconnect("carol").unwrap();
        assert_chronological(&recent);
        assert_chronological(&unread);

        prop_assert!(recent.len() <= limit);
        prop_assert!(recent.iter().all(|m| m.timestamp.as_micros() <= disconnected_at));
        prop_assert!(unread.iter().all(|m| m.timestamp.as_micros() > disconnected_at));

        let before = stamps.iter().filter(|s| **s <= disconnected_at).count();
        prop_assert_eq!(recent.len(), before.min(limit));
        prop_assert_eq!(unread.len(), stamps.len() - before);
    });
}

#[test]
fn redb_and_memory_agree() {
    let dir = tempdir().unwrap();
    let redb = RedbStorage::open(dir.path().join("agree.redb")).unwrap();
    let memory = MemoryStorage::new();

    let stamps = [30u64, 10, 20, 20, 50, 40, 10];
    for (i, stamp) in stamps.iter().enumerate() {
        let message = ChatMessage::new("alice", format!("m{i}"), Timestamp::from_micros(*stamp));
        redb.append_message(&message).unwrap();
        memory.append_message(&message).unwrap();
    }

    for limit in [0, 1, 3, 100] {
        assert_eq!(redb.recent_messages(limit).unwrap(), memory.recent_messages(limit).unwrap());
    }
    for cut in [0u64, 10, 20, 35, 50, 60] {
        let at = Timestamp::from_micros(cut);
        assert_eq!(redb.messages_until(at, 3).unwrap(), memory.messages_until(at, 3).unwrap());
        assert_eq!(redb.messages_after(at).unwrap(), memory.messages_after(at).unwrap());
    }
    assert_eq!(redb.latest_timestamp().unwrap(), memory.latest_timestamp().unwrap());
}

#[test]
fn hub_delivers_when_storage_always_fails() {
    let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);
    let hub = BroadcastHub::new(ManualEnv::default(), storage, 20);

    let (tx_a, mut rx_a) = mpsc::channel(64);
    let (tx_b, mut rx_b) = mpsc::channel(64);
    hub.admit(SessionId::new(1), "alice", SessionHandle::new(tx_a, Arc::new(Notify::new())))
        .unwrap();
    hub.admit(SessionId::new(2), "bob", SessionHandle::new(tx_b, Arc::new(Notify::new())))
        .unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let report = hub.publish("alice", "lost to history, not to bob");
    assert_eq!(report.delivered, 2);
    assert_eq!(drain(&mut rx_b), vec!["alice: lost to history, not to bob"]);
    assert_eq!(drain(&mut rx_a), vec!["alice: lost to history, not to bob"]);

    assert_eq!(hub.depart(SessionId::new(2)).as_deref(), Some("bob"));
    assert_eq!(drain(&mut rx_a), vec!["bob has left the chat."]);

    assert_eq!(hub.storage().inner().message_count(), 0);
    assert!(hub.storage().failure_count() > 0);
}

#[test]
fn prop_hub_delivery_is_independent_of_persistence() {
    proptest!(|(
        failure_rate in 0.0..1.0,
        seed in any::<u64>(),
        bodies in prop::collection::vec("[a-z]{1,8}", 1..30),
    )| {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);
        let hub = BroadcastHub::new(ManualEnv::default(), storage, 20);

        let (tx, mut rx) = mpsc::channel(256);
        hub.admit(SessionId::new(1), "alice", SessionHandle::new(tx, Arc::new(Notify::new())))
            .unwrap();
        drain(&mut rx);

        for body in &bodies {
            hub.publish("alice", body);
        }

        let expected: Vec<String> = bodies.iter().map(|b| format!("alice: {b}")).collect();
        prop_assert_eq!(drain(&mut rx), expected);

        // Whatever was persisted is a subsequence in publish order
        let persisted = hub.storage().inner().recent_messages(usize::MAX).unwrap();
        let mut remaining = bodies.iter();
        for message in &persisted {
            prop_assert!(remaining.any(|b| *b == message.body), "persisted out of order");
        }
    });
}
