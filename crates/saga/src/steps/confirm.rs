use std::sync::Arc;

use async_trait::async_trait;
use domain::NewOrder;
use ledger::LedgerStore;

use super::{OrderDraft, SagaStep, StepOutcome};
use crate::error::Result;
use crate::order_settlement::STEP_CONFIRM;

/// Persists the order as confirmed.
pub struct ConfirmOrder {
    ledger: Arc<dyn LedgerStore>,
}

impl ConfirmOrder {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    async fn persist(&self, draft: &mut OrderDraft) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        let order = tx
            .insert_order(NewOrder {
                order_number: draft.order_number.clone(),
                user_id: draft.request.user_id,
                items: draft.lines.clone(),
                coupon_id: draft.request.coupon_id,
                total_amount: draft.total,
                discount_amount: draft.discount,
                ordered_at: draft.started_at,
            })
            .await?;
        tx.commit().await?;
        draft.order = Some(order);
        Ok(())
    }
}

#[async_trait]
impl SagaStep for ConfirmOrder {
    fn name(&self) -> &'static str {
        STEP_CONFIRM
    }

    async fn execute(&self, mut draft: OrderDraft) -> StepOutcome {
        let result = self.persist(&mut draft).await.map(|()| Vec::new());
        StepOutcome::from_result(draft, result)
    }
}
