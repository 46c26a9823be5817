//! Environment abstraction for time.
//!
//! The hub stamps every message, connect and disconnect with wall-clock time.
//! Reading that time through [`Environment`] keeps the stamping logic testable:
//! production uses [`SystemEnv`], tests drive a [`ManualEnv`] by hand.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Wall-clock instant in microseconds since the Unix epoch.
///
/// Totally ordered and persisted as-is, so backlog windows computed from stored
/// stamps survive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Smallest representable stamp.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw microsecond count.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Raw microsecond count.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// The following stamp, saturating at `u64::MAX`.
    #[must_use]
    pub const fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Source of time for the server.
///
/// `wall_clock` may jump backwards (NTP adjustments); callers that need
/// monotonic stamps must enforce it themselves.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time.
    fn wall_clock(&self) -> Timestamp;

    /// Sleeps for the specified duration.
    ///
    /// Only used by the runtime (accept backoff), never by session logic.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Production environment backed by the system clock.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn wall_clock(&self) -> Timestamp {
        // A clock set before 1970 reads as the epoch; the hub's sequencer
        // still hands out increasing stamps.
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Timestamp(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Hand-driven clock for tests.
///
/// Clones share the same clock. `sleep` yields once without advancing time.
#[derive(Debug, Clone, Default)]
pub struct ManualEnv {
    micros: Arc<AtomicU64>,
}

impl ManualEnv {
    /// Clock starting at `start`.
    #[must_use]
    pub fn starting_at(start: Timestamp) -> Self {
        Self { micros: Arc::new(AtomicU64::new(start.as_micros())) }
    }

    /// Move the clock to `to`, forwards or backwards.
    pub fn set(&self, to: Timestamp) {
        self.micros.store(to.as_micros(), Ordering::SeqCst);
    }

    /// Move the clock forwards by `micros`.
    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Environment for ManualEnv {
    fn wall_clock(&self) -> Timestamp {
        Timestamp(self.micros.load(Ordering::SeqCst))
    }

    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}
