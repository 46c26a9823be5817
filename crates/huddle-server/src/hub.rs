//! Broadcast hub: admission, fan-out and departure.
//!
//! Every operation that changes what sessions see runs inside one ordering
//! section guarded by the sequencer lock. Inside it the hub stamps the event,
//! takes a registry snapshot and queues the encoded line on every recipient's
//! outbound queue. Queueing never blocks, so the section never waits on a
//! peer. Chat messages are persisted after leaving the section.
//!
//! Consequences:
//!
//! - all recipients observe publishes in one total order
//! - a message is never both replayed to a joining session and delivered to
//!   it live
//! - stamps are strictly increasing, even if the wall clock steps back

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use huddle_proto::ServerLine;

use crate::{
    env::{Environment, Timestamp},
    registry::{Delivery, RegistryError, SessionHandle, SessionId, SessionRegistry},
    storage::{ChatMessage, Storage},
};

/// Number of recent messages replayed on registration.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Hands out strictly increasing stamps.
#[derive(Debug)]
struct Sequencer {
    last: Timestamp,
}

impl Sequencer {
    fn stamp(&mut self, now: Timestamp) -> Timestamp {
        let next = now.max(self.last.successor());
        self.last = next;
        next
    }
}

/// Result of fanning one line out to the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Recipients whose queue accepted the line
    pub delivered: usize,
    /// Recipients skipped because their queue was full or closed
    pub dropped: usize,
}

/// What a newly admitted session was sent before its join notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Messages from the recent-history phase
    pub recent: usize,
    /// Messages from the unread phase
    pub unread: usize,
    /// Stamp recorded as the session's `connected_at`
    pub connected_at: Timestamp,
}

/// Fan-out engine shared by all sessions.
pub struct BroadcastHub<E: Environment, S: Storage> {
    registry: SessionRegistry,
    storage: S,
    env: E,
    history_limit: usize,
    sequencer: Mutex<Sequencer>,
}

impl<E: Environment, S: Storage> BroadcastHub<E, S> {
    /// Create a hub over `storage`.
    ///
    /// Stamps continue after the newest one already stored, so history stays
    /// ordered across restarts even if the clock moved backwards.
    pub fn new(env: E, storage: S, history_limit: usize) -> Self {
        let last = match storage.latest_timestamp() {
            Ok(latest) => latest.unwrap_or(Timestamp::ZERO),
            Err(e) => {
                tracing::warn!(error = %e, "could not read latest stored timestamp");
                Timestamp::ZERO
            },
        };

        Self {
            registry: SessionRegistry::new(),
            storage,
            env,
            history_limit,
            sequencer: Mutex::new(Sequencer { last }),
        }
    }

    /// Active sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Register a session and send it its backlog, then announce it.
    ///
    /// History is read before entering the ordering section. Inside it:
    /// 1. claim the username in the registry
    /// 2. queue recent history (up to the last disconnect) followed by unread
    ///    messages (after the last disconnect), as one chunk
    /// 3. record the new session start
    /// 4. fan out the join notice, including to the new session
    ///
    /// A message still being persisted while history is read reaches neither
    /// the replay nor the new session. Storage failures shrink the replay but
    /// never fail admission.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the username is taken; nothing is sent
    /// and nothing is recorded in that case.
    pub fn admit(
        &self,
        id: SessionId,
        username: &str,
        handle: SessionHandle,
    ) -> Result<Admission, RegistryError> {
        if self.registry.is_active(username) {
            return Err(RegistryError::NameTaken(username.to_string()));
        }

        let recent =
            self.storage.messages_up_to_disconnect(username, self.history_limit).unwrap_or_else(
                |e| {
                    tracing::warn!(error = %e, "failed to load recent history");
                    Vec::new()
                },
            );
        let unread = self.storage.messages_since_disconnect(username).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load unread messages");
            Vec::new()
        });

        let mut replay = BytesMut::new();
        for message in recent.iter().chain(&unread) {
            ServerLine::chat(message.username.as_str(), message.body.as_str()).encode(&mut replay);
        }

        let mut sequencer = self.lock_sequencer();

        self.registry.try_register(id, username, handle.clone())?;

        if !replay.is_empty() && handle.deliver(replay.freeze()) != Delivery::Queued {
            tracing::warn!("could not queue backlog replay");
        }

        // User records stay inside the section so a quick reconnect cannot
        // land its connect before the previous disconnect
        let connected_at = sequencer.stamp(self.env.wall_clock());
        if let Err(e) = self.storage.touch_user(username, connected_at) {
            tracing::warn!(error = %e, "failed to record connect");
        }

        self.fan_out(&ServerLine::joined(username).to_bytes());
        drop(sequencer);

        tracing::debug!(recent = recent.len(), unread = unread.len(), "backlog replayed");
        Ok(Admission { recent: recent.len(), unread: unread.len(), connected_at })
    }

    /// Broadcast a chat message to every active session, including the
    /// sender, then persist it.
    ///
    /// Only stamping and fan-out are serialized; appends from concurrent
    /// publishers run in parallel. History stays in stamp order because
    /// storage orders by timestamp. A persistence failure is logged and the
    /// message has still been delivered.
    pub fn publish(&self, username: &str, body: &str) -> FanOut {
        let (message, report) = {
            let mut sequencer = self.lock_sequencer();
            let message = ChatMessage::new(username, body, sequencer.stamp(self.env.wall_clock()));
            let report = self.fan_out(&ServerLine::chat(username, body).to_bytes());
            (message, report)
        };

        if let Err(e) = self.storage.append_message(&message) {
            tracing::warn!(error = %e, "failed to persist message after delivery");
        }

        report
    }

    /// Broadcast a line without persisting it.
    pub fn announce(&self, line: &ServerLine) -> FanOut {
        let _sequencer = self.lock_sequencer();
        self.fan_out(&line.to_bytes())
    }

    /// Unregister a session, record its disconnect and announce it.
    ///
    /// Idempotent: returns the username only for the call that actually
    /// removed the session.
    pub fn depart(&self, id: SessionId) -> Option<String> {
        let mut sequencer = self.lock_sequencer();

        let username = self.registry.unregister(id)?;

        let disconnected_at = sequencer.stamp(self.env.wall_clock());
        if let Err(e) = self.storage.mark_disconnected(&username, disconnected_at) {
            tracing::warn!(error = %e, username = %username, "failed to record disconnect");
        }

        self.fan_out(&ServerLine::left(username.as_str()).to_bytes());
        Some(username)
    }

    /// Queue `bytes` on every registered session.
    ///
    /// A full queue means the recipient stopped reading; it misses this line
    /// and is asked to tear down. Other recipients are unaffected.
    fn fan_out(&self, bytes: &Bytes) -> FanOut {
        let mut report = FanOut::default();

        for recipient in self.registry.snapshot() {
            match recipient.handle.deliver(bytes.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Full => {
                    tracing::warn!(
                        session_id = %recipient.id,
                        username = %recipient.username,
                        "outbound queue full, evicting slow consumer"
                    );
                    recipient.handle.kick();
                    report.dropped += 1;
                },
                Delivery::Closed => {
                    tracing::debug!(session_id = %recipient.id, "recipient already closing");
                    report.dropped += 1;
                },
            }
        }

        report
    }

    fn lock_sequencer(&self) -> MutexGuard<'_, Sequencer> {
        self.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::sync::{Notify, mpsc};

    use super::*;
    use crate::{
        env::ManualEnv,
        storage::{MemoryStorage, StorageError, UserRecord},
    };

    struct Peer {
        id: SessionId,
        handle: SessionHandle,
        rx: mpsc::Receiver<Bytes>,
        kick: Arc<Notify>,
    }

    impl Peer {
        fn new(raw: u64, depth: usize) -> Self {
            let (tx, rx) = mpsc::channel(depth);
            let kick = Arc::new(Notify::new());
            Self {
                id: SessionId::new(raw),
                handle: SessionHandle::new(tx, Arc::clone(&kick)),
                rx,
                kick,
            }
        }

        /// Everything queued so far, split into lines.
        fn lines(&mut self) -> Vec<String> {
            let mut text = String::new();
            while let Ok(chunk) = self.rx.try_recv() {
                text.push_str(std::str::from_utf8(&chunk).unwrap());
            }
            text.lines().map(str::to_string).collect()
        }
    }

    fn hub() -> (BroadcastHub<ManualEnv, MemoryStorage>, ManualEnv) {
        let env = ManualEnv::starting_at(Timestamp::from_micros(1_000));
        (BroadcastHub::new(env.clone(), MemoryStorage::new(), DEFAULT_HISTORY_LIMIT), env)
    }

    #[test]
    fn sequencer_is_strictly_increasing() {
        let mut sequencer = Sequencer { last: Timestamp::from_micros(10) };
        assert_eq!(sequencer.stamp(Timestamp::from_micros(50)), Timestamp::from_micros(50));
        assert_eq!(sequencer.stamp(Timestamp::from_micros(50)), Timestamp::from_micros(51));
        // Clock stepped back
        assert_eq!(sequencer.stamp(Timestamp::from_micros(5)), Timestamp::from_micros(52));
    }

    #[test]
    fn admit_sends_join_to_everyone() {
        let (hub, _env) = hub();
        let mut alice = Peer::new(1, 16);
        let mut bob = Peer::new(2, 16);

        hub.admit(alice.id, "alice", alice.handle.clone()).unwrap();
        assert_eq!(alice.lines(), vec!["alice has joined the chat."]);

        hub.admit(bob.id, "bob", bob.handle.clone()).unwrap();
        assert_eq!(alice.lines(), vec!["bob has joined the chat."]);
        assert_eq!(bob.lines(), vec!["bob has joined the chat."]);
    }

    #[test]
    fn taken_name_sends_nothing() {
        let (hub, _env) = hub();
        let first = Peer::new(1, 16);
        let mut second = Peer::new(2, 16);

        hub.admit(first.id, "dave", first.handle.clone()).unwrap();
        let err = hub.admit(second.id, "dave", second.handle.clone()).unwrap_err();

        assert_eq!(err, RegistryError::NameTaken("dave".to_string()));
        assert!(second.lines().is_empty());
        assert_eq!(hub.registry().len(), 1);
    }

    #[test]
    fn publish_reaches_sender_and_is_persisted() {
        let (hub, _env) = hub();
        let mut alice = Peer::new(1, 16);
        let mut bob = Peer::new(2, 16);
        hub.admit(alice.id, "alice", alice.handle.clone()).unwrap();
        hub.admit(bob.id, "bob", bob.handle.clone()).unwrap();
        alice.lines();
        bob.lines();

        let report = hub.publish("alice", "hello");
        assert_eq!(report, FanOut { delivered: 2, dropped: 0 });
        assert_eq!(alice.lines(), vec!["alice: hello"]);
        assert_eq!(bob.lines(), vec!["alice: hello"]);
        assert_eq!(hub.storage().message_count(), 1);
    }

    #[test]
    fn first_time_user_gets_recent_history() {
        let (hub, _env) = hub();
        let alice = Peer::new(1, 64);
        hub.admit(alice.id, "alice", alice.handle.clone()).unwrap();
        for i in 0..25 {
            hub.publish("alice", &format!("m{i}"));
        }

        let mut bob = Peer::new(2, 16);
        let admission = hub.admit(bob.id, "bob", bob.handle.clone()).unwrap();
        assert_eq!(admission.recent, DEFAULT_HISTORY_LIMIT);
        assert_eq!(admission.unread, 0);

        let lines = bob.lines();
        assert_eq!(lines.len(), DEFAULT_HISTORY_LIMIT + 1);
        assert_eq!(lines[0], "alice: m5");
        assert_eq!(lines[19], "alice: m24");
        assert_eq!(lines[20], "bob has joined the chat.");
    }

    #[test]
    fn returning_user_gets_context_then_unread() {
        let (hub, env) = hub();
        let alice = Peer::new(1, 64);
        hub.admit(alice.id, "alice", alice.handle.clone()).unwrap();

        let carol = Peer::new(2, 64);
        hub.admit(carol.id, "carol", carol.handle.clone()).unwrap();
        hub.publish("alice", "before");
        env.advance(10);
        assert_eq!(hub.depart(carol.id).as_deref(), Some("carol"));

        // Same wall-clock reading as the disconnect; the sequencer still
        // orders the message after it
        hub.publish("alice", "missed");

        let mut carol = Peer::new(3, 64);
        let admission = hub.admit(carol.id, "carol", carol.handle.clone()).unwrap();
        assert_eq!((admission.recent, admission.unread), (1, 1));
        assert_eq!(carol.lines(), vec![
            "alice: before",
            "alice: missed",
            "carol has joined the chat."
        ]);
    }

    #[test]
    fn depart_is_idempotent() {
        let (hub, _env) = hub();
        let mut alice = Peer::new(1, 16);
        let bob = Peer::new(2, 16);
        hub.admit(alice.id, "alice", alice.handle.clone()).unwrap();
        hub.admit(bob.id, "bob", bob.handle.clone()).unwrap();
        alice.lines();

        assert_eq!(hub.depart(bob.id).as_deref(), Some("bob"));
        assert_eq!(hub.depart(bob.id), None);

        assert_eq!(alice.lines(), vec!["bob has left the chat."]);
        let record = hub.storage().load_user("bob").unwrap().unwrap();
        assert!(record.disconnected_at.is_some());
    }

    #[test]
    fn full_queue_evicts_only_that_recipient() {
        let (hub, _env) = hub();
        let mut fast = Peer::new(1, 16);
        let slow = Peer::new(2, 1);
        hub.admit(slow.id, "slow", slow.handle.clone()).unwrap();
        hub.admit(fast.id, "fast", fast.handle.clone()).unwrap();
        fast.lines();

        // slow's single slot is still holding its join notice
        let report = hub.publish("fast", "hi");
        assert_eq!(report, FanOut { delivered: 1, dropped: 1 });
        assert_eq!(fast.lines(), vec!["fast: hi"]);

        let kicked = slow.kick.notified();
        tokio::pin!(kicked);
        assert!(futures_ready(kicked.as_mut()));
    }

    #[test]
    fn closed_recipient_does_not_block_others() {
        let (hub, _env) = hub();
        let gone = Peer::new(1, 16);
        let mut bob = Peer::new(2, 16);
        hub.admit(gone.id, "gone", gone.handle.clone()).unwrap();
        hub.admit(bob.id, "bob", bob.handle.clone()).unwrap();
        bob.lines();

        // Writer side of "gone" died; its queue is closed
        drop(gone.rx);

        let report = hub.publish("bob", "still delivered");
        assert_eq!(report, FanOut { delivered: 1, dropped: 1 });
        assert_eq!(bob.lines(), vec!["bob: still delivered"]);
        assert_eq!(hub.storage().message_count(), 1);
    }

    /// Storage whose appends are slow but may overlap.
    #[derive(Clone, Default)]
    struct SlowAppends {
        inner: MemoryStorage,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Storage for SlowAppends {
        fn touch_user(&self, username: &str, at: Timestamp) -> Result<(), StorageError> {
            self.inner.touch_user(username, at)
        }

        fn mark_disconnected(&self, username: &str, at: Timestamp) -> Result<(), StorageError> {
            self.inner.mark_disconnected(username, at)
        }

        fn load_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
            self.inner.load_user(username)
        }

        fn append_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.append_message(message)
        }

        fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StorageError> {
            self.inner.recent_messages(limit)
        }

        fn messages_until(
            &self,
            until: Timestamp,
            limit: usize,
        ) -> Result<Vec<ChatMessage>, StorageError> {
            self.inner.messages_until(until, limit)
        }

        fn messages_after(&self, after: Timestamp) -> Result<Vec<ChatMessage>, StorageError> {
            self.inner.messages_after(after)
        }

        fn latest_timestamp(&self) -> Result<Option<Timestamp>, StorageError> {
            self.inner.latest_timestamp()
        }
    }

    #[test]
    fn concurrent_publishes_persist_in_parallel() {
        const PUBLISHERS: usize = 4;

        let storage = SlowAppends::default();
        let hub = BroadcastHub::new(ManualEnv::default(), storage.clone(), DEFAULT_HISTORY_LIMIT);
        let mut watcher = Peer::new(1, 64);
        hub.admit(watcher.id, "watcher", watcher.handle.clone()).unwrap();
        watcher.lines();

        let barrier = Barrier::new(PUBLISHERS);
        std::thread::scope(|scope| {
            for i in 0..PUBLISHERS {
                let (hub, barrier) = (&hub, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    hub.publish(&format!("user{i}"), "hi");
                });
            }
        });

        assert!(storage.peak.load(Ordering::SeqCst) > 1, "appends ran one at a time");

        // Live order and stored order agree
        let live = watcher.lines();
        let stored: Vec<String> = hub
            .storage()
            .recent_messages(usize::MAX)
            .unwrap()
            .iter()
            .map(|m| format!("{}: {}", m.username, m.body))
            .collect();
        assert_eq!(live.len(), PUBLISHERS);
        assert_eq!(live, stored);
    }

    #[test]
    fn announce_is_not_persisted() {
        let (hub, _env) = hub();
        let mut alice = Peer::new(1, 16);
        hub.admit(alice.id, "alice", alice.handle.clone()).unwrap();
        alice.lines();

        hub.announce(&ServerLine::Notice("Server is shutting down.".to_string()));
        assert_eq!(alice.lines(), vec!["Server is shutting down."]);
        assert_eq!(hub.storage().message_count(), 0);
    }

    #[test]
    fn stamps_continue_after_stored_history() {
        let storage = MemoryStorage::new();
        storage.append_message(&ChatMessage::new("a", "old", Timestamp::from_micros(5_000))).unwrap();

        // Clock is behind what is already stored
        let env = ManualEnv::starting_at(Timestamp::from_micros(100));
        let hub = BroadcastHub::new(env, storage, DEFAULT_HISTORY_LIMIT);
        hub.publish("a", "new");

        let history = hub.storage().recent_messages(10).unwrap();
        assert_eq!(history[1].body, "new");
        assert!(history[1].timestamp > history[0].timestamp);
    }

    /// Poll a future once with a no-op waker.
    fn futures_ready<F: std::future::Future>(fut: std::pin::Pin<&mut F>) -> bool {
        let mut cx = std::task::Context::from_waker(std::task::Waker::noop());
        fut.poll(&mut cx).is_ready()
    }
}
