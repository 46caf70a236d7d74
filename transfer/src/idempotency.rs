//! Processed-step tracking.
//!
//! The bus delivers at least once. Each role records the [`StepKey`]s it has
//! finished so that a redelivered message is recognised and skipped instead
//! of moving money twice. Redeliveries arrive within minutes, so keys are
//! only remembered for a limited time.

use crate::types::StepKey;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long a handled step is remembered by default (24 hours).
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Set of steps a role has already handled.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether `key` was marked before and has not expired.
    async fn contains(&self, key: &StepKey) -> bool;

    /// Record `key` as handled.
    async fn mark(&self, key: StepKey);
}

#[derive(Default)]
struct Marks {
    at: HashMap<StepKey, Instant>,
    /// Marks in the order they were made, oldest first
    order: VecDeque<(Instant, StepKey)>,
}

/// Process-local [`IdempotencyStore`] with expiring entries.
///
/// Lost on restart; a restarted role relies on the ledger's own key tracking.
/// Expired entries are dropped whenever a new key is marked.
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    marks: Mutex<Marks>,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_IDEMPOTENCY_TTL)
    }
}

impl InMemoryIdempotencyStore {
    /// Create an empty store with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store whose entries expire after `ttl`.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            marks: Mutex::new(Marks::default()),
        }
    }

    fn marks(&self) -> MutexGuard<'_, Marks> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys recorded, expired ones included until the next mark.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks().at.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn contains(&self, key: &StepKey) -> bool {
        self.marks()
            .at
            .get(key)
            .is_some_and(|marked| marked.elapsed() < self.ttl)
    }

    async fn mark(&self, key: StepKey) {
        let mut guard = self.marks();
        let marks = &mut *guard;
        while let Some((marked, _)) = marks.order.front() {
            if marked.elapsed() < self.ttl {
                break;
            }
            if let Some((marked, expired)) = marks.order.pop_front() {
                // A later mark of the same key supersedes this one
                if marks.at.get(&expired) == Some(&marked) {
                    marks.at.remove(&expired);
                }
            }
        }

        let now = Instant::now();
        marks.at.insert(key.clone(), now);
        marks.order.push_back((now, key));
    }
}
