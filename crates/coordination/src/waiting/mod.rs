//! Per-key member sets ordered by arrival.
//!
//! Each key (one per coupon template) holds members ranked by a
//! monotonically increasing arrival score. A companion "already issued"
//! marker set per key is consulted on every insert, and both structures
//! expire after a TTL so abandoned lists clean themselves up.
//!
//! This store is ephemeral. Anything it says about issuance must be
//! confirmed against the ledger.

mod memory;
mod redis_list;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::Result;

pub use memory::InMemoryWaitingList;
pub use redis_list::RedisWaitingList;

/// How long idle waiting lists and issued markers survive.
pub const DEFAULT_WAITING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One waiting member and its arrival score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub member: String,
    pub score: u64,
}

#[async_trait]
pub trait WaitingList: Send + Sync {
    /// Adds `member` under `key` unless it is already waiting, and returns
    /// its zero-based rank.
    ///
    /// The issued-marker check, the insert and the TTL refresh happen as
    /// one atomic unit. A member that is already waiting keeps its original
    /// score.
    ///
    /// # Errors
    ///
    /// `AlreadyIssued` if the member carries the issued marker for `key`.
    async fn insert(&self, key: &str, member: &str, score: u64) -> Result<u64>;

    /// Returns the lowest-score member without removing it.
    async fn peek_oldest(&self, key: &str) -> Result<Option<WaitingEntry>>;

    /// Removes and returns the lowest-score member.
    async fn remove_oldest(&self, key: &str) -> Result<Option<WaitingEntry>>;

    async fn remove(&self, key: &str, member: &str) -> Result<bool>;

    async fn size(&self, key: &str) -> Result<u64>;

    /// Zero-based rank of a waiting member.
    async fn position(&self, key: &str, member: &str) -> Result<Option<u64>>;

    /// Keys whose lists currently hold members, sorted.
    ///
    /// Drained and expired lists are forgotten.
    async fn keys(&self) -> Result<Vec<String>>;

    async fn mark_issued(&self, key: &str, member: &str) -> Result<()>;

    async fn is_issued(&self, key: &str, member: &str) -> Result<bool>;

    /// Drops every waiting member of `key`.
    async fn clear(&self, key: &str) -> Result<()>;

    /// Drops every issued marker of `key`.
    async fn clear_issued(&self, key: &str) -> Result<()>;
}

/// Source of strictly increasing arrival scores.
///
/// Scores are wall-clock microseconds, bumped by one whenever two calls
/// land in the same microsecond or the clock steps backwards.
#[derive(Debug, Default)]
pub struct ArrivalClock {
    last: AtomicU64,
}

impl ArrivalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}
