use chrono::{DateTime, Utc};
use common::{IssuanceId, Money, TemplateId, UserId};
use serde::{Deserialize, Serialize};

use super::CouponTemplate;
use crate::error::DomainError;

/// One template unit bound to one user.
///
/// At most one issuance exists per `(template_id, user_id)`. `used` and
/// `used_at` always move together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuance {
    pub id: IssuanceId,
    pub template_id: TemplateId,
    pub user_id: UserId,
    pub code: String,
    pub used: bool,
    pub issued_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl Issuance {
    /// Checks whether this coupon can be applied to an order of `order_total`.
    pub fn check_usable(
        &self,
        template: &CouponTemplate,
        order_total: Money,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.used {
            return Err(DomainError::CouponAlreadyUsed);
        }
        if template.is_expired(now) {
            return Err(DomainError::CouponExpired);
        }
        if order_total < template.min_order_amount {
            return Err(DomainError::BelowMinimumOrder {
                minimum: template.min_order_amount,
                total: order_total,
            });
        }
        Ok(())
    }

    /// Marks the coupon as redeemed.
    pub fn redeem(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.used {
            return Err(DomainError::CouponAlreadyUsed);
        }
        self.used = true;
        self.used_at = Some(now);
        Ok(())
    }

    /// Returns the coupon to the unused state.
    pub fn revert(&mut self) {
        self.used = false;
        self.used_at = None;
    }
}

/// Input for recording a freshly allocated issuance.
#[derive(Debug, Clone)]
pub struct NewIssuance {
    pub template_id: TemplateId,
    pub user_id: UserId,
    pub code: String,
    pub issued_at: DateTime<Utc>,
}

impl NewIssuance {
    /// Builds an issuance stamped at `now` with a fresh code.
    pub fn new(template_id: TemplateId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            template_id,
            user_id,
            code: generate_code(now),
            issued_at: now,
        }
    }
}

/// Generates a coupon code of the form `yyyyMMddHHmmss-XXXXXXXX`.
pub fn generate_code(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}
