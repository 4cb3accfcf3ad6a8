//! The single logical consumer that drains deferred coupon requests.
//!
//! The loop is drain-fast, idle-slow: after a unit of work it immediately
//! looks for the next one, and only sleeps for the poll interval when
//! nothing was found. A cluster-wide lock per source makes sure only one
//! consumer is deciding a unit of that source at any moment, which is what
//! keeps the queue strictly FIFO per template.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::LockCoordinator;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConsumerConfig;
use crate::error::Result;

/// Key of the lock held while a unit of `source` is decided.
///
/// Each source gets its own key, so draining one never stalls another.
pub fn consumer_lock_key(source: &str) -> String {
    format!("coupon-queue:consumer:{source}")
}

/// Something the consumer can drain one unit at a time.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Decides at most one unit of work.
    ///
    /// Returns true if a unit was found. Business failures of the unit are
    /// recorded on the unit itself; an `Err` means the source could not be
    /// read or written at all.
    async fn process_one(&self) -> Result<bool>;

    /// Units waiting for a decision.
    async fn backlog(&self) -> Result<u64>;
}

/// Repeatedly drains a [`WorkSource`] until cancelled.
pub struct QueueConsumer {
    source: Arc<dyn WorkSource>,
    locks: LockCoordinator,
    config: ConsumerConfig,
    lock_key: String,
}

impl QueueConsumer {
    pub fn new(source: Arc<dyn WorkSource>, locks: LockCoordinator, config: ConsumerConfig) -> Self {
        let lock_key = consumer_lock_key(source.name());
        Self {
            source,
            locks,
            config,
            lock_key,
        }
    }

    /// Runs one step under the consumer lock.
    ///
    /// Returns true if a unit was processed. Errors are logged here so the
    /// loop never stops on a bad unit.
    pub async fn step(&self) -> bool {
        let guard = match self
            .locks
            .try_lock(&self.lock_key, self.config.unit_lease)
            .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::trace!(source = self.source.name(), "another consumer is active");
                return false;
            }
            Err(e) => {
                tracing::error!(source = self.source.name(), error = %e, "consumer lock unavailable");
                return false;
            }
        };

        let found = match self.source.process_one().await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(source = self.source.name(), error = %e, "queue consumer step failed");
                false
            }
        };

        if let Err(e) = guard.release().await {
            tracing::warn!(source = self.source.name(), error = %e, "consumer lock release failed");
        }
        found
    }

    /// Processes units until none is left. Returns how many were processed.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while self.step().await {
            processed += 1;
        }
        processed
    }

    /// Runs the consumer loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            source = self.source.name(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "queue consumer started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.step().await {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(source = self.source.name(), "queue consumer shutting down");
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
