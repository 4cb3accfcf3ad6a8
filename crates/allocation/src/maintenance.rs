//! Periodic queue housekeeping: backlog reporting and the stuck scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::allocator::QueuedAllocator;
use crate::config::ConsumerConfig;
use crate::consumer::WorkSource;

/// Reports the backlog of `source` every `period` until cancelled.
pub fn spawn_backlog_reporter(
    source: Arc<dyn WorkSource>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => report_backlog(source.as_ref()).await,
            }
        }
        tracing::debug!(source = source.name(), "backlog reporter stopped");
    })
}

async fn report_backlog(source: &dyn WorkSource) {
    match source.backlog().await {
        Ok(depth) => {
            metrics::gauge!("coupon_queue_backlog", "source" => source.name()).set(depth as f64);
            tracing::info!(source = source.name(), depth, "queue backlog");
        }
        Err(e) => tracing::warn!(source = source.name(), error = %e, "backlog check failed"),
    }
}

/// Fails and optionally requeues stuck `PROCESSING` items on a fixed tick.
pub fn spawn_stuck_scanner(
    queue: Arc<QueuedAllocator>,
    config: ConsumerConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.stuck_scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            threshold_secs = config.stuck_threshold.as_secs(),
            auto_requeue = config.auto_requeue,
            "stuck work scanner started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = queue.fail_stuck(config.stuck_threshold, config.auto_requeue).await {
                        tracing::warn!(error = %e, "stuck work scan failed");
                    }
                }
            }
        }
        tracing::info!("stuck work scanner shutting down");
    })
}
