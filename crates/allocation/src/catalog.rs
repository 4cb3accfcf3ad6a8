//! Coupon template definitions and per-user issuance listings.

use std::sync::Arc;

use chrono::Utc;
use common::UserId;
use domain::{CouponTemplate, Issuance, NewCouponTemplate};
use ledger::LedgerStore;

use crate::allocator::{TemplateRef, find_template};
use crate::error::{AllocationError, Result};

pub struct CouponCatalog {
    ledger: Arc<dyn LedgerStore>,
}

impl CouponCatalog {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Defines a new template with its full inventory remaining.
    #[tracing::instrument(skip(self, template), fields(name = %template.name))]
    pub async fn create_template(&self, template: NewCouponTemplate) -> Result<CouponTemplate> {
        template.validate(Utc::now())?;
        let name = template.name.clone();
        match self.ledger.insert_template(template).await {
            Ok(created) => {
                tracing::info!(
                    template_id = %created.id,
                    total_count = created.total_count,
                    "coupon template created"
                );
                Ok(created)
            }
            Err(e) if e.is_unique_violation() => Err(AllocationError::TemplateExists(name)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn template(&self, template: &TemplateRef) -> Result<CouponTemplate> {
        find_template(self.ledger.as_ref(), template).await
    }

    /// All coupons a user holds, oldest first.
    pub async fn list_user_issuances(&self, user_id: UserId) -> Result<Vec<Issuance>> {
        Ok(self.ledger.issuances_for_user(user_id).await?)
    }
}
