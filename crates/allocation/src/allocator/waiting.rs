use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::UserId;
use coordination::{ArrivalClock, CoordinationError, WaitingList};
use domain::Issuance;
use ledger::LedgerStore;

use super::{
    Allocation, InventoryAllocator, TemplateRef, allocate_locked, duplicate, ensure_user,
    find_template,
};
use crate::config::CouponStrategy;
use crate::consumer::WorkSource;
use crate::error::{AllocationError, Result};

/// The decision for one member taken off a waiting list.
#[derive(Debug)]
pub struct WaitingOutcome {
    pub key: String,
    pub user_id: UserId,
    pub result: Result<Issuance>,
}

/// Admission by arrival order through an ephemeral waiting list.
///
/// Each template name is a waiting-list key and each user id a member.
/// Joining is cheap and never touches the template row; the consumer pops
/// the oldest member and allocates for it. The issued marker in the list
/// is a fast path only, and the ledger stays authoritative.
pub struct WaitingListAllocator {
    ledger: Arc<dyn LedgerStore>,
    list: Arc<dyn WaitingList>,
    clock: ArrivalClock,
}

impl WaitingListAllocator {
    pub fn new(ledger: Arc<dyn LedgerStore>, list: Arc<dyn WaitingList>) -> Self {
        Self {
            ledger,
            list,
            clock: ArrivalClock::new(),
        }
    }

    /// Puts the user in line for `template`.
    ///
    /// Returns the zero-based position in the waiting list.
    #[tracing::instrument(skip(self))]
    pub async fn join(&self, user_id: UserId, template: &TemplateRef) -> Result<Allocation> {
        ensure_user(self.ledger.as_ref(), user_id).await?;
        let found = find_template(self.ledger.as_ref(), template).await?;
        let key = found.name.clone();
        let member = user_id.to_string();

        if self.list.is_issued(&key, &member).await? {
            return Err(duplicate(user_id, &key));
        }
        if self
            .ledger
            .find_issuance_for(found.id, user_id)
            .await?
            .is_some()
        {
            // The marker was lost with the ephemeral store; restore it.
            self.list.mark_issued(&key, &member).await?;
            return Err(duplicate(user_id, &key));
        }
        if !found.can_issue(Utc::now()) {
            return Err(AllocationError::OutOfStock(key));
        }

        let position = match self.list.insert(&key, &member, self.clock.next()).await {
            Ok(position) => position,
            Err(CoordinationError::AlreadyIssued { .. }) => return Err(duplicate(user_id, &key)),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(%key, position, "joined waiting list");
        Ok(Allocation::Waiting { key, position })
    }

    /// Zero-based position of a waiting user.
    pub async fn position(&self, user_id: UserId, template_name: &str) -> Result<Option<u64>> {
        Ok(self
            .list
            .position(template_name, &user_id.to_string())
            .await?)
    }

    pub async fn size(&self, template_name: &str) -> Result<u64> {
        Ok(self.list.size(template_name).await?)
    }

    /// Takes the oldest member of `key` off the list and allocates for it.
    ///
    /// Returns `None` when the list is empty.
    pub async fn process_key(&self, key: &str) -> Result<Option<WaitingOutcome>> {
        let Some(entry) = self.list.remove_oldest(key).await? else {
            return Ok(None);
        };

        let Ok(raw) = entry.member.parse::<i64>() else {
            tracing::warn!(%key, member = %entry.member, "dropping malformed waiting member");
            return Ok(None);
        };
        let user_id = UserId::new(raw);
        let result = self.allocate(key, user_id).await;

        match &result {
            Ok(_) | Err(AllocationError::DuplicateAllocation { .. }) => {
                self.list.mark_issued(key, &entry.member).await?;
            }
            Err(_) => {}
        }
        match &result {
            Ok(issuance) => {
                metrics::counter!("coupon_allocations_total", "strategy" => "waiting-list")
                    .increment(1);
                tracing::info!(%key, %user_id, issuance_id = %issuance.id, "waiting member issued");
            }
            Err(e) => {
                metrics::counter!(
                    "coupon_allocation_rejections_total",
                    "strategy" => "waiting-list",
                    "reason" => e.reason()
                )
                .increment(1);
                tracing::info!(%key, %user_id, error = %e, "waiting member rejected");
            }
        }
        metrics::counter!("coupon_queue_processed_total", "outcome" => outcome_label(&result))
            .increment(1);

        Ok(Some(WaitingOutcome {
            key: key.to_string(),
            user_id,
            result,
        }))
    }

    async fn allocate(&self, key: &str, user_id: UserId) -> Result<Issuance> {
        ensure_user(self.ledger.as_ref(), user_id).await?;
        let mut tx = self.ledger.begin().await?;
        let template = TemplateRef::Name(key.to_string());
        let issuance = allocate_locked(tx.as_mut(), &template, user_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(issuance)
    }
}

fn outcome_label(result: &Result<Issuance>) -> &'static str {
    if result.is_ok() { "completed" } else { "failed" }
}

#[async_trait]
impl InventoryAllocator for WaitingListAllocator {
    async fn request(&self, user_id: UserId, template: TemplateRef) -> Result<Allocation> {
        self.join(user_id, &template).await
    }

    fn strategy(&self) -> CouponStrategy {
        CouponStrategy::WaitingList
    }
}

#[async_trait]
impl WorkSource for WaitingListAllocator {
    fn name(&self) -> &'static str {
        "waiting_list"
    }

    /// Serves one member from every non-empty key.
    async fn process_one(&self) -> Result<bool> {
        let mut found = false;
        for key in self.list.keys().await? {
            if self.process_key(&key).await?.is_some() {
                found = true;
            }
        }
        Ok(found)
    }

    async fn backlog(&self) -> Result<u64> {
        let mut total = 0;
        for key in self.list.keys().await? {
            total += self.list.size(&key).await?;
        }
        Ok(total)
    }
}
