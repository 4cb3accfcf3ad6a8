use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::UserId;
use domain::Issuance;
use ledger::{Counter, LedgerStore};

use super::{
    Allocation, InventoryAllocator, TemplateRef, allocate_locked, duplicate, ensure_user,
    find_template, insert_issuance, record_outcome,
};
use crate::config::CouponStrategy;
use crate::error::{AllocationError, Result};

/// How the direct path guards the template counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectMode {
    /// `SELECT … FOR UPDATE` on the template for the whole allocation.
    RowLock,
    /// One conditional decrement; its row lock covers the rest of the
    /// transaction.
    ConditionalDecrement,
}

/// Decides each request synchronously against the template row.
pub struct DirectAllocator {
    ledger: Arc<dyn LedgerStore>,
    mode: DirectMode,
}

impl DirectAllocator {
    pub fn new(ledger: Arc<dyn LedgerStore>, mode: DirectMode) -> Self {
        Self { ledger, mode }
    }

    pub fn mode(&self) -> DirectMode {
        self.mode
    }

    /// Issues one unit of `template` to `user_id`.
    ///
    /// # Errors
    ///
    /// - `DuplicateAllocation` if the user already holds one
    /// - `OutOfStock` if nothing is left or the template expired
    /// - `TemplateNotFound` / `UserNotFound` for missing references
    #[tracing::instrument(skip(self), fields(mode = ?self.mode))]
    pub async fn allocate(&self, user_id: UserId, template: &TemplateRef) -> Result<Issuance> {
        let result = match self.mode {
            DirectMode::RowLock => self.allocate_row_lock(user_id, template).await,
            DirectMode::ConditionalDecrement => self.allocate_conditional(user_id, template).await,
        };
        record_outcome(self.strategy(), &result);
        match &result {
            Ok(issuance) => {
                tracing::info!(issuance_id = %issuance.id, code = %issuance.code, "coupon issued")
            }
            Err(e) => tracing::debug!(error = %e, "coupon request rejected"),
        }
        result
    }

    async fn allocate_row_lock(&self, user_id: UserId, template: &TemplateRef) -> Result<Issuance> {
        ensure_user(self.ledger.as_ref(), user_id).await?;

        let mut tx = self.ledger.begin().await?;
        let issuance = allocate_locked(tx.as_mut(), template, user_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(issuance)
    }

    async fn allocate_conditional(
        &self,
        user_id: UserId,
        template: &TemplateRef,
    ) -> Result<Issuance> {
        ensure_user(self.ledger.as_ref(), user_id).await?;
        let found = find_template(self.ledger.as_ref(), template).await?;
        let now = Utc::now();
        if found.is_expired(now) {
            return Err(AllocationError::OutOfStock(found.name));
        }

        if self
            .ledger
            .find_issuance_for(found.id, user_id)
            .await?
            .is_some()
        {
            return Err(duplicate(user_id, &found.name));
        }

        let mut tx = self.ledger.begin().await?;
        let taken = tx
            .conditional_decrement(Counter::CouponRemaining(found.id), 1)
            .await?;
        if taken == 0 {
            return Err(AllocationError::OutOfStock(found.name));
        }

        // The decrement holds the template row until commit, so this second
        // look cannot race another request by the same user. The first one
        // above only makes a holder hear about the duplicate after sell-out.
        if tx.issuance_exists(found.id, user_id).await? {
            return Err(duplicate(user_id, &found.name));
        }
        let issuance = insert_issuance(tx.as_mut(), &found, user_id, now).await?;
        tx.commit().await?;
        Ok(issuance)
    }
}

#[async_trait]
impl InventoryAllocator for DirectAllocator {
    async fn request(&self, user_id: UserId, template: TemplateRef) -> Result<Allocation> {
        self.allocate(user_id, &template).await.map(Allocation::Issued)
    }

    fn strategy(&self) -> CouponStrategy {
        match self.mode {
            DirectMode::RowLock => CouponStrategy::RowLock,
            DirectMode::ConditionalDecrement => CouponStrategy::Conditional,
        }
    }
}
