//! Allocation strategies.

mod direct;
mod queued;
mod waiting;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{TemplateId, UserId};
use domain::{CouponTemplate, Issuance, NewIssuance, WorkItem};
use ledger::{LedgerStore, LedgerTx};
use serde::Serialize;

use crate::config::CouponStrategy;
use crate::error::{AllocationError, Result};

pub use direct::{DirectAllocator, DirectMode};
pub use queued::{QueueSummary, QueuedAllocator};
pub use waiting::{WaitingListAllocator, WaitingOutcome};

/// How a caller names a coupon template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateRef {
    Id(TemplateId),
    Name(String),
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateRef::Id(id) => write!(f, "#{id}"),
            TemplateRef::Name(name) => f.write_str(name),
        }
    }
}

impl From<TemplateId> for TemplateRef {
    fn from(id: TemplateId) -> Self {
        TemplateRef::Id(id)
    }
}

impl From<&str> for TemplateRef {
    fn from(name: &str) -> Self {
        TemplateRef::Name(name.to_string())
    }
}

impl From<String> for TemplateRef {
    fn from(name: String) -> Self {
        TemplateRef::Name(name)
    }
}

/// What a coupon request produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Allocation {
    /// Decided synchronously: the unit is the caller's.
    Issued(Issuance),
    /// Accepted into the durable queue. The decision comes later.
    Enqueued(WorkItem),
    /// Accepted into the waiting list at `position`.
    Waiting { key: String, position: u64 },
}

impl Allocation {
    pub fn issuance(&self) -> Option<&Issuance> {
        match self {
            Allocation::Issued(issuance) => Some(issuance),
            _ => None,
        }
    }
}

/// A coupon issuance strategy.
#[async_trait]
pub trait InventoryAllocator: Send + Sync {
    /// Requests one unit of `template` for `user_id`.
    async fn request(&self, user_id: UserId, template: TemplateRef) -> Result<Allocation>;

    fn strategy(&self) -> CouponStrategy;
}

pub(crate) async fn find_template(
    ledger: &dyn LedgerStore,
    template: &TemplateRef,
) -> Result<CouponTemplate> {
    let found = match template {
        TemplateRef::Id(id) => ledger.find_template(*id).await?,
        TemplateRef::Name(name) => ledger.find_template_by_name(name).await?,
    };
    found.ok_or_else(|| AllocationError::TemplateNotFound(template.to_string()))
}

pub(crate) async fn ensure_user(ledger: &dyn LedgerStore, user_id: UserId) -> Result<()> {
    match ledger.find_user(user_id).await? {
        Some(_) => Ok(()),
        None => Err(AllocationError::UserNotFound(user_id)),
    }
}

/// Allocates one unit inside `tx` while holding the template's row lock.
///
/// The duplicate check runs under that same lock, so two requests by one
/// user cannot both pass it.
pub(crate) async fn allocate_locked(
    tx: &mut dyn LedgerTx,
    template: &TemplateRef,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<Issuance> {
    let locked = match template {
        TemplateRef::Id(id) => tx.lock_template(*id).await?,
        TemplateRef::Name(name) => tx.lock_template_by_name(name).await?,
    };
    let mut locked =
        locked.ok_or_else(|| AllocationError::TemplateNotFound(template.to_string()))?;

    // A holder is told about the duplicate even once the template sold out.
    if tx.issuance_exists(locked.id, user_id).await? {
        return Err(duplicate(user_id, &locked.name));
    }
    if !locked.can_issue(now) {
        return Err(AllocationError::OutOfStock(locked.name));
    }

    locked.take_unit();
    tx.save_template(&locked).await?;
    insert_issuance(tx, &locked, user_id, now).await
}

/// Inserts the issuance row, mapping the uniqueness backstop to a duplicate.
pub(crate) async fn insert_issuance(
    tx: &mut dyn LedgerTx,
    template: &CouponTemplate,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<Issuance> {
    match tx
        .insert_issuance(NewIssuance::new(template.id, user_id, now))
        .await
    {
        Ok(issuance) => Ok(issuance),
        Err(e) if e.is_unique_violation() => Err(duplicate(user_id, &template.name)),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn duplicate(user_id: UserId, template: &str) -> AllocationError {
    AllocationError::DuplicateAllocation {
        user_id,
        template: template.to_string(),
    }
}

/// Records the outcome of a synchronous allocation.
pub(crate) fn record_outcome<T>(strategy: CouponStrategy, result: &Result<T>) {
    match result {
        Ok(_) => {
            metrics::counter!("coupon_allocations_total", "strategy" => strategy.as_str())
                .increment(1);
        }
        Err(e) => {
            metrics::counter!(
                "coupon_allocation_rejections_total",
                "strategy" => strategy.as_str(),
                "reason" => e.reason()
            )
            .increment(1);
        }
    }
}
