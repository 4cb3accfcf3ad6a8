//! Orders and their line items.

mod value_objects;

use chrono::{DateTime, Utc};
use common::{IssuanceId, Money, OrderId, UserId};
use serde::{Deserialize, Serialize};

pub use value_objects::{OrderItem, OrderNumber};

use crate::error::{DomainError, validation};

/// A confirmed order.
///
/// Orders are never deleted. Cancellation sets `cancelled_at` exactly once,
/// and only after the stock, wallet and coupon effects have been reversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: OrderNumber,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub coupon_id: Option<IssuanceId>,
    pub total_amount: Money,
    pub discount_amount: Money,
    pub final_amount: Money,
    pub ordered_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// Marks the order cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.is_cancelled() {
            return Err(DomainError::AlreadyCancelled(self.order_number.to_string()));
        }
        self.cancelled_at = Some(now);
        Ok(())
    }
}

/// An order ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_number: OrderNumber,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub coupon_id: Option<IssuanceId>,
    pub total_amount: Money,
    pub discount_amount: Money,
    pub ordered_at: DateTime<Utc>,
}

impl NewOrder {
    /// Returns the amount actually charged.
    pub fn final_amount(&self) -> Money {
        self.total_amount.saturating_sub(self.discount_amount)
    }

    /// Attaches the persisted id.
    pub fn into_order(self, id: OrderId) -> Order {
        let final_amount = self.final_amount();
        Order {
            id,
            order_number: self.order_number,
            user_id: self.user_id,
            items: self.items,
            coupon_id: self.coupon_id,
            total_amount: self.total_amount,
            discount_amount: self.discount_amount,
            final_amount,
            ordered_at: self.ordered_at,
            cancelled_at: None,
        }
    }
}

/// Sums line totals.
///
/// Fails with a validation error when a line or the sum overflows.
pub fn total_of(items: &[OrderItem]) -> Result<Money, DomainError> {
    items
        .iter()
        .try_fold(Money::zero(), |acc, item| {
            item.line_total().and_then(|line| acc.checked_add(line))
        })
        .ok_or_else(|| validation("order total exceeds the supported amount"))
}
