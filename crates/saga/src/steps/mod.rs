//! The ordered steps of an order settlement.
//!
//! Each step receives the draft built so far and either advances it or
//! aborts. Both outcomes carry the compensations for whatever the step
//! committed, so the driver can undo them in reverse order.

mod confirm;
mod coupon;
mod pricing;
mod reserve;
mod validate;
mod wallet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IssuanceId, Money, ProductId, UserId};
use domain::{Order, OrderItem, OrderNumber, Product};
use serde::{Deserialize, Serialize};

use crate::compensation::Compensation;
use crate::error::{Result, SagaError};

pub use confirm::ConfirmOrder;
pub use coupon::ApplyCoupon;
pub use pricing::PriceLines;
pub use reserve::ReserveStock;
pub use validate::ValidateOrder;
pub use wallet::DebitWallet;

/// One requested item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// What a caller asks to buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: UserId,
    pub items: Vec<OrderLine>,
    #[serde(default)]
    pub coupon_id: Option<IssuanceId>,
}

/// Partial order state handed from step to step.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub order_number: OrderNumber,
    pub request: OrderRequest,
    pub started_at: DateTime<Utc>,
    /// Product snapshots taken right after stock was reserved, one per
    /// requested line.
    pub reserved: Vec<(Product, u32)>,
    pub lines: Vec<OrderItem>,
    pub total: Money,
    pub discount: Money,
    pub order: Option<Order>,
}

impl OrderDraft {
    pub fn new(request: OrderRequest) -> Self {
        Self {
            order_number: OrderNumber::generate(),
            request,
            started_at: Utc::now(),
            reserved: Vec::new(),
            lines: Vec::new(),
            total: Money::zero(),
            discount: Money::zero(),
            order: None,
        }
    }

    /// Amount due after the discount.
    pub fn final_amount(&self) -> Money {
        self.total.saturating_sub(self.discount)
    }
}

/// Result of executing one step.
#[derive(Debug)]
pub enum StepOutcome {
    Advance {
        draft: OrderDraft,
        compensations: Vec<Compensation>,
    },
    Abort {
        error: SagaError,
        compensations: Vec<Compensation>,
    },
}

impl StepOutcome {
    /// Wraps the result of a step that commits all or nothing.
    pub(crate) fn from_result(draft: OrderDraft, result: Result<Vec<Compensation>>) -> Self {
        match result {
            Ok(compensations) => StepOutcome::Advance {
                draft,
                compensations,
            },
            Err(error) => StepOutcome::Abort {
                error,
                compensations: Vec::new(),
            },
        }
    }
}

/// A single settlement step.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, draft: OrderDraft) -> StepOutcome;
}
