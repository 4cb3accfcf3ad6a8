use async_trait::async_trait;
use domain::OrderItem;
use domain::order::total_of;

use super::{OrderDraft, SagaStep, StepOutcome};
use crate::order_settlement::STEP_PRICE_LINES;

/// Captures name and unit price from the reserved product snapshots.
///
/// The captured values are what the order keeps forever, whatever happens
/// to the product afterwards. A total that does not fit in [`Money`] aborts
/// the order as invalid.
///
/// [`Money`]: common::Money
pub struct PriceLines;

#[async_trait]
impl SagaStep for PriceLines {
    fn name(&self) -> &'static str {
        STEP_PRICE_LINES
    }

    async fn execute(&self, mut draft: OrderDraft) -> StepOutcome {
        draft.lines = draft
            .reserved
            .iter()
            .map(|(product, quantity)| {
                OrderItem::new(product.id, product.name.clone(), product.price, *quantity)
            })
            .collect();
        match total_of(&draft.lines) {
            Ok(total) => {
                draft.total = total;
                StepOutcome::Advance {
                    draft,
                    compensations: Vec::new(),
                }
            }
            Err(e) => StepOutcome::Abort {
                error: e.into(),
                compensations: Vec::new(),
            },
        }
    }
}
