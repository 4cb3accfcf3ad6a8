use async_trait::async_trait;

use super::{OrderDraft, SagaStep, StepOutcome};
use crate::compensation::Compensation;
use crate::order_settlement::STEP_DEBIT_WALLET;
use crate::services::WalletService;

/// Debits the final amount with a single conditional decrement.
pub struct DebitWallet {
    wallet: WalletService,
}

impl DebitWallet {
    pub fn new(wallet: WalletService) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl SagaStep for DebitWallet {
    fn name(&self) -> &'static str {
        STEP_DEBIT_WALLET
    }

    async fn execute(&self, draft: OrderDraft) -> StepOutcome {
        let user_id = draft.request.user_id;
        let amount = draft.final_amount();
        // Fully discounted orders touch no wallet.
        if !amount.is_positive() {
            return StepOutcome::from_result(draft, Ok(Vec::new()));
        }

        let result = self
            .wallet
            .debit(user_id, amount)
            .await
            .map(|()| vec![Compensation::RefundWallet { user_id, amount }]);
        StepOutcome::from_result(draft, result)
    }
}
