use chrono::{DateTime, Utc};
use common::{Money, TemplateId};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, validation};

/// A coupon definition with a fixed number of issuable units.
///
/// `remaining_count` only ever decreases, and only through an allocation
/// that holds the row lock or uses the conditional decrement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponTemplate {
    pub id: TemplateId,
    pub name: String,
    pub total_count: i64,
    pub remaining_count: i64,
    pub discount_amount: Money,
    pub min_order_amount: Money,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CouponTemplate {
    /// Returns true once `now` is past the expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Returns true if at least one unit is left.
    pub fn has_remaining(&self) -> bool {
        self.remaining_count > 0
    }

    /// Returns true if a unit may be issued at `now`.
    pub fn can_issue(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.has_remaining()
    }

    /// Takes one unit out of the remaining count.
    ///
    /// Returns false without changing anything when nothing is left. The
    /// caller must hold the template's row lock.
    pub fn take_unit(&mut self) -> bool {
        if !self.has_remaining() {
            return false;
        }
        self.remaining_count -= 1;
        true
    }

    /// Computes the discount this template grants on an order total.
    ///
    /// The discount never exceeds the total itself.
    pub fn discount_for(&self, order_total: Money) -> Money {
        self.discount_amount.min(order_total)
    }
}

/// Input for creating a coupon template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCouponTemplate {
    pub name: String,
    pub total_count: i64,
    pub discount_amount: Money,
    pub min_order_amount: Money,
    pub expires_at: DateTime<Utc>,
}

impl NewCouponTemplate {
    /// Checks the template definition against the creation rules.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(validation("coupon name must not be blank"));
        }
        if self.total_count <= 0 {
            return Err(validation("total count must be greater than 0"));
        }
        if !self.discount_amount.is_positive() {
            return Err(validation("discount amount must be greater than 0"));
        }
        if self.min_order_amount.is_negative() {
            return Err(validation("minimum order amount must not be negative"));
        }
        if self.expires_at <= now {
            return Err(validation("expiry must be in the future"));
        }
        Ok(())
    }
}
