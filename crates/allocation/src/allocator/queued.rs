use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{UserId, WorkItemId};
use domain::{NewWorkItem, WorkItem, WorkStatus};
use ledger::LedgerStore;
use serde::Serialize;

use super::{Allocation, InventoryAllocator, TemplateRef, allocate_locked, find_template};
use crate::config::CouponStrategy;
use crate::consumer::WorkSource;
use crate::error::{AllocationError, Result};

/// Error recorded on items failed by the stuck scan.
pub const STUCK_MESSAGE: &str = "processing timed out";

/// Work item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Queue-serialized allocation.
///
/// Requests only create `PENDING` work items. A single consumer later
/// claims the oldest one, allocates against the template and records
/// `COMPLETED` with the issuance id or `FAILED` with the cause.
pub struct QueuedAllocator {
    ledger: Arc<dyn LedgerStore>,
}

impl QueuedAllocator {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Queues a request for `template_name`.
    ///
    /// A user with an outstanding request for the same template gets that
    /// request back instead of a second one.
    #[tracing::instrument(skip(self))]
    pub async fn enqueue(&self, user_id: UserId, template_name: &str) -> Result<WorkItem> {
        let template_name = template_name.trim();
        if template_name.is_empty() {
            return Err(domain::DomainError::Validation(
                "template name must not be blank".to_string(),
            )
            .into());
        }

        if let Some(existing) = self
            .ledger
            .find_outstanding_work_item(user_id, template_name)
            .await?
        {
            tracing::debug!(work_item_id = %existing.id, "request already queued");
            return Ok(existing);
        }

        match self
            .ledger
            .insert_work_item(NewWorkItem::new(user_id, template_name, Utc::now()))
            .await
        {
            Ok(item) => {
                tracing::info!(work_item_id = %item.id, "coupon request queued");
                Ok(item)
            }
            // Lost a race with a concurrent enqueue of the same request.
            Err(e) if e.is_unique_violation() => self
                .ledger
                .find_outstanding_work_item(user_id, template_name)
                .await?
                .ok_or_else(|| e.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a queued request.
    pub async fn status(&self, id: WorkItemId) -> Result<WorkItem> {
        self.ledger
            .find_work_item(id)
            .await?
            .ok_or(AllocationError::WorkItemNotFound(id))
    }

    /// Puts a `FAILED` request back to `PENDING`.
    #[tracing::instrument(skip(self))]
    pub async fn retry(&self, id: WorkItemId) -> Result<WorkItem> {
        let mut tx = self.ledger.begin().await?;
        let mut item = tx
            .lock_work_item(id)
            .await?
            .ok_or(AllocationError::WorkItemNotFound(id))?;
        item.retry()?;
        tx.save_work_item(&item).await?;
        tx.commit().await?;
        tracing::info!(work_item_id = %id, "work item requeued");
        Ok(item)
    }

    pub async fn summary(&self) -> Result<QueueSummary> {
        Ok(QueueSummary {
            pending: self.ledger.count_work_items(WorkStatus::Pending).await?,
            processing: self.ledger.count_work_items(WorkStatus::Processing).await?,
            completed: self.ledger.count_work_items(WorkStatus::Completed).await?,
            failed: self.ledger.count_work_items(WorkStatus::Failed).await?,
        })
    }

    /// Claims and decides the oldest pending request.
    ///
    /// Returns the finished item, or `None` when the queue is empty. Any
    /// allocation failure is recorded on the item as `FAILED` rather than
    /// returned.
    pub async fn process_next(&self) -> Result<Option<WorkItem>> {
        let Some(claimed) = self.claim_next().await? else {
            return Ok(None);
        };

        let finished = match self.allocate_for(&claimed).await {
            Ok(done) => {
                metrics::counter!("coupon_queue_processed_total", "outcome" => "completed")
                    .increment(1);
                metrics::counter!("coupon_allocations_total", "strategy" => "queue").increment(1);
                tracing::info!(
                    work_item_id = %done.id,
                    user_id = %done.user_id,
                    template = %done.template_name,
                    "queued coupon request completed"
                );
                done
            }
            Err(e) => {
                metrics::counter!("coupon_queue_processed_total", "outcome" => "failed")
                    .increment(1);
                metrics::counter!(
                    "coupon_allocation_rejections_total",
                    "strategy" => "queue",
                    "reason" => e.reason()
                )
                .increment(1);
                tracing::info!(
                    work_item_id = %claimed.id,
                    user_id = %claimed.user_id,
                    template = %claimed.template_name,
                    error = %e,
                    "queued coupon request failed"
                );
                self.mark_failed(claimed.id, &e.to_string()).await?
            }
        };
        Ok(Some(finished))
    }

    /// Fails `PROCESSING` items that started before `now - threshold`.
    ///
    /// With `requeue` the failed items go straight back to `PENDING`.
    /// Returns how many items were affected.
    #[tracing::instrument(skip(self))]
    pub async fn fail_stuck(&self, threshold: Duration, requeue: bool) -> Result<usize> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| domain::DomainError::Validation(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let mut affected = 0;
        for candidate in self.ledger.stuck_work_items(cutoff).await? {
            let mut tx = self.ledger.begin().await?;
            let Some(mut item) = tx.lock_work_item(candidate.id).await? else {
                continue;
            };
            // The consumer may have finished it since the scan.
            if !item.is_stuck(cutoff) {
                continue;
            }
            item.fail(STUCK_MESSAGE, Utc::now())?;
            if requeue {
                item.retry()?;
            }
            tx.save_work_item(&item).await?;
            tx.commit().await?;

            affected += 1;
            tracing::warn!(
                work_item_id = %item.id,
                started_at = ?candidate.started_at,
                requeued = requeue,
                "stuck work item reset"
            );
        }

        if affected > 0 {
            metrics::counter!("coupon_queue_stuck_total").increment(affected as u64);
        }
        Ok(affected)
    }

    async fn claim_next(&self) -> Result<Option<WorkItem>> {
        let mut tx = self.ledger.begin().await?;
        let Some(mut item) = tx.lock_next_work_item().await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        item.start_processing(Utc::now())?;
        tx.save_work_item(&item).await?;
        tx.commit().await?;
        Ok(Some(item))
    }

    /// Allocates and completes the item in one transaction.
    async fn allocate_for(&self, claimed: &WorkItem) -> Result<WorkItem> {
        if self.ledger.find_user(claimed.user_id).await?.is_none() {
            return Err(AllocationError::UserNotFound(claimed.user_id));
        }

        let mut tx = self.ledger.begin().await?;
        let mut item = tx
            .lock_work_item(claimed.id)
            .await?
            .ok_or(AllocationError::WorkItemNotFound(claimed.id))?;

        let now = Utc::now();
        let template = TemplateRef::Name(item.template_name.clone());
        let issuance = allocate_locked(tx.as_mut(), &template, item.user_id, now).await?;
        item.complete(issuance.id, now)?;
        tx.save_work_item(&item).await?;
        tx.commit().await?;
        Ok(item)
    }

    async fn mark_failed(&self, id: WorkItemId, message: &str) -> Result<WorkItem> {
        let mut tx = self.ledger.begin().await?;
        let mut item = tx
            .lock_work_item(id)
            .await?
            .ok_or(AllocationError::WorkItemNotFound(id))?;
        item.fail(message, Utc::now())?;
        tx.save_work_item(&item).await?;
        tx.commit().await?;
        Ok(item)
    }
}

#[async_trait]
impl InventoryAllocator for QueuedAllocator {
    async fn request(&self, user_id: UserId, template: TemplateRef) -> Result<Allocation> {
        let name = match template {
            TemplateRef::Name(name) => name,
            TemplateRef::Id(_) => find_template(self.ledger.as_ref(), &template).await?.name,
        };
        self.enqueue(user_id, &name).await.map(Allocation::Enqueued)
    }

    fn strategy(&self) -> CouponStrategy {
        CouponStrategy::Queue
    }
}

#[async_trait]
impl WorkSource for QueuedAllocator {
    fn name(&self) -> &'static str {
        "work_queue"
    }

    async fn process_one(&self) -> Result<bool> {
        Ok(self.process_next().await?.is_some())
    }

    async fn backlog(&self) -> Result<u64> {
        let pending = self.ledger.count_work_items(WorkStatus::Pending).await?;
        Ok(pending.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use ledger::{InMemoryLedger, LedgerStoreExt};

    use super::super::test_support::{ledger_with_template, users};
    use super::*;

    #[tokio::test]
    async fn test_enqueue_defers_the_decision() {
        let (ledger, template) = ledger_with_template("FLASH", 1).await;
        let user = users(&ledger, 1).await[0];
        let queue = QueuedAllocator::new(ledger.clone());

        let item = queue.enqueue(user, "FLASH").await.unwrap();
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(ledger.count_issuances(template.id).await.unwrap(), 0);

        let done = queue.process_next().await.unwrap().unwrap();
        assert_eq!(done.status, WorkStatus::Completed);
        assert!(done.result_id.is_some());
        assert!(done.processed_at.is_some());
        assert_eq!(queue.status(item.id).await.unwrap(), done);
        assert!(queue.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_returns_outstanding_request() {
        let (ledger, _) = ledger_with_template("FLASH", 1).await;
        let queue = QueuedAllocator::new(ledger);
        let user = UserId::new(7);

        let first = queue.enqueue(user, "FLASH").await.unwrap();
        let second = queue.enqueue(user, " FLASH ").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(queue.summary().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_create_one_item() {
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(QueuedAllocator::new(ledger));

        let tasks = (0..10).map(|_| {
            let queue = queue.clone();
            async move { queue.enqueue(UserId::new(3), "FLASH").await.unwrap().id }
        });
        let ids = futures_util::future::join_all(tasks).await;
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(queue.summary().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_and_retryable() {
        let (ledger, template) = ledger_with_template("FLASH", 1).await;
        let ids = users(&ledger, 2).await;
        let queue = QueuedAllocator::new(ledger.clone());

        queue.enqueue(ids[0], "FLASH").await.unwrap();
        let late = queue.enqueue(ids[1], "FLASH").await.unwrap();
        queue.process_next().await.unwrap();

        let failed = queue.process_next().await.unwrap().unwrap();
        assert_eq!(failed.id, late.id);
        assert_eq!(failed.status, WorkStatus::Failed);
        assert!(failed.error_message.as_deref().unwrap().contains("sold out"));

        ledger
            .increment(ledger::Counter::CouponRemaining(template.id), 1)
            .await
            .unwrap();
        let retried = queue.retry(late.id).await.unwrap();
        assert_eq!(retried.status, WorkStatus::Pending);
        assert!(retried.error_message.is_none());
        assert!(retried.processed_at.is_none());

        let done = queue.process_next().await.unwrap().unwrap();
        assert_eq!(done.status, WorkStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_template_or_user_fails_the_item() {
        let (ledger, _) = ledger_with_template("FLASH", 5).await;
        let user = users(&ledger, 1).await[0];
        let queue = QueuedAllocator::new(ledger);

        queue.enqueue(user, "GHOST").await.unwrap();
        queue.enqueue(UserId::new(404), "FLASH").await.unwrap();

        let ghost = queue.process_next().await.unwrap().unwrap();
        assert_eq!(ghost.status, WorkStatus::Failed);
        let nobody = queue.process_next().await.unwrap().unwrap();
        assert_eq!(nobody.status, WorkStatus::Failed);
        assert_eq!(queue.summary().await.unwrap().failed, 2);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = QueuedAllocator::new(ledger);
        let item = queue.enqueue(UserId::new(1), "FLASH").await.unwrap();

        let err = queue.retry(item.id).await.unwrap_err();
        assert!(matches!(err, AllocationError::Domain(_)));
        assert!(matches!(
            queue.retry(WorkItemId::new(99)).await.unwrap_err(),
            AllocationError::WorkItemNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_stuck_items_are_failed_and_requeued() {
        let (ledger, _) = ledger_with_template("FLASH", 5).await;
        let user = users(&ledger, 1).await[0];
        let queue = QueuedAllocator::new(ledger.clone());
        let item = queue.enqueue(user, "FLASH").await.unwrap();

        // Claim the item and abandon it mid-flight.
        queue.claim_next().await.unwrap().unwrap();
        assert_eq!(queue.fail_stuck(Duration::from_secs(60), true).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.fail_stuck(Duration::ZERO, false).await.unwrap(), 1);
        let failed = queue.status(item.id).await.unwrap();
        assert_eq!(failed.status, WorkStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(STUCK_MESSAGE));

        queue.retry(item.id).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.fail_stuck(Duration::ZERO, true).await.unwrap(), 1);
        assert_eq!(queue.status(item.id).await.unwrap().status, WorkStatus::Pending);
    }

    #[tokio::test]
    async fn test_queue_path_is_fifo() {
        let (ledger, template) = ledger_with_template("FLASH", 3).await;
        let ids = users(&ledger, 6).await;
        let queue = QueuedAllocator::new(ledger.clone());

        let mut items = Vec::new();
        for user in &ids {
            items.push(queue.enqueue(*user, "FLASH").await.unwrap());
        }
        while queue.process_next().await.unwrap().is_some() {}

        for (i, item) in items.iter().enumerate() {
            let status = queue.status(item.id).await.unwrap().status;
            let expected = if i < 3 {
                WorkStatus::Completed
            } else {
                WorkStatus::Failed
            };
            assert_eq!(status, expected, "arrival {i}");
        }
        let after = ledger.find_template(template.id).await.unwrap().unwrap();
        assert_eq!(after.remaining_count, 0);
    }
}
