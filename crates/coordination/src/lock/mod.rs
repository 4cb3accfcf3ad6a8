//! Named, leased, exclusive locks.
//!
//! A lock is granted to one holder at a time for at most its lease. The
//! lease bounds how long a crashed holder can block everyone else, so it
//! must exceed the worst-case critical section. Every grant carries a
//! fencing token that strictly increases per key.
//!
//! Locking several keys together is the caller's business: acquire them in
//! one global order (for example sorted by id) or risk circular waits.

mod memory;
mod redis_lock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoordinationError, Result};

pub use memory::InMemoryLockBackend;
pub use redis_lock::RedisLockBackend;

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub holder: String,
    /// Strictly increasing per key across grants.
    pub fencing_token: u64,
    pub lease: Duration,
}

/// Storage for lock ownership.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Grants the lock if it is free or its previous lease has expired.
    ///
    /// Returns `None` while another holder's lease is live.
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration)
        -> Result<Option<LockLease>>;

    /// Releases the lock if `lease.holder` still owns it.
    ///
    /// Returns false when the lease already expired or changed hands.
    async fn release(&self, lease: &LockLease) -> Result<bool>;
}

/// Wait and lease defaults plus the retry backoff between attempts.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// How long `acquire` keeps retrying.
    pub wait: Duration,
    /// Maximum hold time before the lock frees itself.
    pub lease: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(3),
            lease: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

/// Grants locks from a [`LockBackend`] with bounded waiting.
#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    node_id: String,
    options: LockOptions,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            node_id: Uuid::new_v4().simple().to_string(),
            options: LockOptions::default(),
        }
    }

    /// A coordinator over a fresh process-local backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLockBackend::new()))
    }

    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquires `key` with the configured wait and lease.
    pub async fn lock(&self, key: &str) -> Result<LockGuard> {
        self.acquire(key, self.options.wait, self.options.lease).await
    }

    /// Acquires `key`, retrying with jittered exponential backoff until
    /// `wait` elapses.
    ///
    /// # Errors
    ///
    /// `LockAcquisitionFailed` if the lock stayed held for the whole wait.
    pub async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> Result<LockGuard> {
        let holder = self.holder_id();
        let started = Instant::now();
        let deadline = started + wait;
        let mut backoff = self.options.initial_backoff;

        loop {
            if let Some(granted) = self.backend.try_acquire(key, &holder, lease).await? {
                let waited = started.elapsed();
                counter!("lock_acquisitions_total").increment(1);
                histogram!("lock_wait_seconds").record(waited.as_secs_f64());
                debug!(
                    key,
                    fencing_token = granted.fencing_token,
                    waited_ms = waited.as_millis() as u64,
                    "lock acquired"
                );
                return Ok(LockGuard::new(self.backend.clone(), granted));
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = wait.as_millis() as u64;
                counter!("lock_acquisition_failures_total").increment(1);
                warn!(key, waited_ms, "lock acquisition timed out");
                return Err(CoordinationError::LockAcquisitionFailed {
                    key: key.to_string(),
                    waited_ms,
                });
            }

            let half = backoff.as_millis() as u64 / 2;
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=half));
            tokio::time::sleep((backoff + jitter).min(deadline - now)).await;
            backoff = (backoff * 2).min(self.options.max_backoff);
        }
    }

    /// Takes `key` only if it is free right now.
    pub async fn try_lock(&self, key: &str, lease: Duration) -> Result<Option<LockGuard>> {
        let holder = self.holder_id();
        let granted = self.backend.try_acquire(key, &holder, lease).await?;
        Ok(granted.map(|lease| {
            counter!("lock_acquisitions_total").increment(1);
            LockGuard::new(self.backend.clone(), lease)
        }))
    }

    /// Runs `f` while holding `key`, then releases it.
    ///
    /// The release runs whether `f` succeeds or fails. A failed release is
    /// logged and never replaces `f`'s result.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CoordinationError>,
    {
        let guard = self.acquire(key, wait, lease).await?;
        let result = f().await;
        if let Err(e) = guard.release().await {
            warn!(key, error = %e, "lock release failed; lease will expire");
        }
        result
    }

    fn holder_id(&self) -> String {
        format!("{}:{}", self.node_id, Uuid::new_v4().simple())
    }
}

/// A held lock. Dropping it schedules a best-effort release.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    lease: Option<LockLease>,
}

impl LockGuard {
    fn new(backend: Arc<dyn LockBackend>, lease: LockLease) -> Self {
        Self {
            backend,
            lease: Some(lease),
        }
    }

    pub fn key(&self) -> &str {
        self.lease.as_ref().map(|l| l.key.as_str()).unwrap_or_default()
    }

    pub fn fencing_token(&self) -> u64 {
        self.lease.as_ref().map(|l| l.fencing_token).unwrap_or_default()
    }

    /// Releases the lock now.
    ///
    /// # Errors
    ///
    /// `LockLost` if the lease expired and someone else took the key.
    pub async fn release(mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        if self.backend.release(&lease).await? {
            debug!(key = %lease.key, fencing_token = lease.fencing_token, "lock released");
            Ok(())
        } else {
            Err(CoordinationError::LockLost { key: lease.key })
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        // Outside a runtime the lease simply expires.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        handle.spawn(async move {
            match backend.release(&lease).await {
                Ok(_) => debug!(key = %lease.key, "lock released on drop"),
                Err(e) => debug!(key = %lease.key, error = %e, "release on drop failed"),
            }
        });
    }
}
