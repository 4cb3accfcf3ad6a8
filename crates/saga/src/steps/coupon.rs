use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::IssuanceId;
use ledger::LedgerStore;

use super::{OrderDraft, SagaStep, StepOutcome};
use crate::compensation::Compensation;
use crate::error::{Result, SagaError};
use crate::order_settlement::STEP_APPLY_COUPON;

/// Redeems the order's coupon, if any, and sets the discount.
pub struct ApplyCoupon {
    ledger: Arc<dyn LedgerStore>,
}

impl ApplyCoupon {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    async fn redeem(&self, draft: &mut OrderDraft, coupon_id: IssuanceId) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.ledger.begin().await?;
        let mut issuance = tx
            .lock_issuance(coupon_id)
            .await?
            .filter(|issuance| issuance.user_id == draft.request.user_id)
            .ok_or(SagaError::CouponNotFound(coupon_id))?;
        let template = self
            .ledger
            .find_template(issuance.template_id)
            .await?
            .ok_or(SagaError::CouponNotFound(coupon_id))?;

        issuance
            .check_usable(&template, draft.total, now)
            .and_then(|()| issuance.redeem(now))
            .map_err(|reason| SagaError::CouponNotUsable { coupon_id, reason })?;
        tx.save_issuance(&issuance).await?;
        tx.commit().await?;

        draft.discount = template.discount_for(draft.total);
        Ok(())
    }
}

#[async_trait]
impl SagaStep for ApplyCoupon {
    fn name(&self) -> &'static str {
        STEP_APPLY_COUPON
    }

    async fn execute(&self, mut draft: OrderDraft) -> StepOutcome {
        let Some(coupon_id) = draft.request.coupon_id else {
            return StepOutcome::from_result(draft, Ok(Vec::new()));
        };
        let result = self
            .redeem(&mut draft, coupon_id)
            .await
            .map(|()| vec![Compensation::RevertCoupon { coupon_id }]);
        StepOutcome::from_result(draft, result)
    }
}
