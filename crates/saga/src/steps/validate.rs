use std::sync::Arc;

use async_trait::async_trait;
use ledger::LedgerStore;

use super::{OrderDraft, SagaStep, StepOutcome};
use crate::compensation::Compensation;
use crate::error::{Result, SagaError};
use crate::order_settlement::STEP_VALIDATE;

/// Rejects unknown users, empty orders and zero quantities.
pub struct ValidateOrder {
    ledger: Arc<dyn LedgerStore>,
}

impl ValidateOrder {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    async fn run(&self, draft: &OrderDraft) -> Result<Vec<Compensation>> {
        let request = &draft.request;
        if self.ledger.find_user(request.user_id).await?.is_none() {
            return Err(SagaError::UserNotFound(request.user_id));
        }
        if request.items.is_empty() {
            return Err(SagaError::EmptyOrder);
        }
        if let Some(line) = request.items.iter().find(|line| line.quantity == 0) {
            return Err(SagaError::InvalidQuantity {
                product_id: line.product_id,
                quantity: line.quantity,
            });
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl SagaStep for ValidateOrder {
    fn name(&self) -> &'static str {
        STEP_VALIDATE
    }

    async fn execute(&self, draft: OrderDraft) -> StepOutcome {
        let result = self.run(&draft).await;
        StepOutcome::from_result(draft, result)
    }
}
