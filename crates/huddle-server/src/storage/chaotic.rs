//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to test error handling.
//! Used for chaos testing to check that the hub keeps delivering live messages
//! when persistence is broken.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use super::{ChatMessage, Storage, StorageError, UserRecord};
use crate::env::Timestamp;

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but randomly fails
/// operations based on a configured failure rate. A failed operation never
/// reaches the inner storage, so the inner state only reflects operations that
/// reported success.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
    failure_count: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Uses linear congruential generator (LCG) for fast, deterministic randomness.
/// This keeps chaos tests reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    #[allow(clippy::cast_precision_loss)]
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            failure_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Number of operations that were made to fail.
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether it fails.
    fn roll(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let fail =
            self.rng.lock().unwrap_or_else(PoisonError::into_inner).next() < self.failure_rate;
        if fail {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }

        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn touch_user(&self, username: &str, connected_at: Timestamp) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.touch_user(username, connected_at)
    }

    fn mark_disconnected(
        &self,
        username: &str,
        disconnected_at: Timestamp,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.mark_disconnected(username, disconnected_at)
    }

    fn load_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        self.roll()?;
        self.inner.load_user(username)
    }

    fn append_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.append_message(message)
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, StorageError> {
        self.roll()?;
        self.inner.recent_messages(limit)
    }

    fn messages_until(
        &self,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.roll()?;
        self.inner.messages_until(until, limit)
    }

    fn messages_after(&self, after: Timestamp) -> Result<Vec<ChatMessage>, StorageError> {
        self.roll()?;
        self.inner.messages_after(after)
    }

    fn latest_timestamp(&self) -> Result<Option<Timestamp>, StorageError> {
        self.roll()?;
        self.inner.latest_timestamp()
    }
}
