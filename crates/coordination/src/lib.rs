//! Cross-process coordination primitives.
//!
//! - [`LockCoordinator`]: named, leased, exclusive locks with a bounded wait
//! - [`WaitingList`]: per-key member sets ordered by arrival score, with an
//!   "already issued" marker checked atomically on insert
//!
//! Each primitive has an in-memory backend for single-process runs and tests
//! and a Redis backend for deployments with more than one process.

pub mod error;
pub mod lock;
pub mod waiting;

pub use error::{CoordinationError, Result};
pub use lock::{
    InMemoryLockBackend, LockBackend, LockCoordinator, LockGuard, LockLease, LockOptions,
    RedisLockBackend,
};
pub use waiting::{
    ArrivalClock, InMemoryWaitingList, RedisWaitingList, WaitingEntry, WaitingList,
    DEFAULT_WAITING_TTL,
};
