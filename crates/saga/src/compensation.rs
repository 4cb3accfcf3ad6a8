//! Actions that undo committed settlement steps.

use std::sync::Arc;

use async_trait::async_trait;
use common::{IssuanceId, Money, ProductId, UserId};
use ledger::LedgerStore;
use serde::Serialize;

use crate::error::{Result, SagaError};
use crate::order_settlement::{STEP_APPLY_COUPON, STEP_DEBIT_WALLET, STEP_RESERVE_STOCK};
use crate::services::{StockService, WalletService};

/// Reverses the effect of one committed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Compensation {
    RestoreStock {
        product_id: ProductId,
        quantity: i64,
    },
    RevertCoupon {
        coupon_id: IssuanceId,
    },
    RefundWallet {
        user_id: UserId,
        amount: Money,
    },
}

impl Compensation {
    /// Name of the step this compensation undoes.
    pub fn step(&self) -> &'static str {
        match self {
            Compensation::RestoreStock { .. } => STEP_RESERVE_STOCK,
            Compensation::RevertCoupon { .. } => STEP_APPLY_COUPON,
            Compensation::RefundWallet { .. } => STEP_DEBIT_WALLET,
        }
    }
}

/// Applies compensations.
#[async_trait]
pub trait Compensator: Send + Sync {
    async fn compensate(&self, compensation: &Compensation) -> Result<()>;
}

/// Applies compensations directly against the ledger.
#[derive(Clone)]
pub struct LedgerCompensator {
    ledger: Arc<dyn LedgerStore>,
    stock: StockService,
    wallet: WalletService,
}

impl LedgerCompensator {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            stock: StockService::new(ledger.clone()),
            wallet: WalletService::new(ledger.clone()),
            ledger,
        }
    }

    async fn revert_coupon(&self, coupon_id: IssuanceId) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        let mut issuance = tx
            .lock_issuance(coupon_id)
            .await?
            .ok_or(SagaError::CouponNotFound(coupon_id))?;
        issuance.revert();
        tx.save_issuance(&issuance).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Compensator for LedgerCompensator {
    async fn compensate(&self, compensation: &Compensation) -> Result<()> {
        match *compensation {
            Compensation::RestoreStock {
                product_id,
                quantity,
            } => self.stock.restore(product_id, quantity).await,
            Compensation::RevertCoupon { coupon_id } => self.revert_coupon(coupon_id).await,
            Compensation::RefundWallet { user_id, amount } => {
                self.wallet.refund(user_id, amount).await
            }
        }
    }
}
