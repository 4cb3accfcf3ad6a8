//! Settlement saga driver and order cancellation.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::{ProductId, UserId};
use coordination::LockCoordinator;
use domain::{DomainError, Order, OrderNumber};
use ledger::{Counter, LedgerStore};
use ranking::SalesRecorder;
use serde::Serialize;

use crate::compensation::{Compensation, Compensator, LedgerCompensator};
use crate::config::SettlementConfig;
use crate::error::{Result, SagaError};
use crate::order_settlement::SAGA_TYPE;
use crate::services::{StockService, WalletService};
use crate::state::SagaState;
use crate::steps::{
    ApplyCoupon, ConfirmOrder, DebitWallet, OrderDraft, OrderRequest, PriceLines, ReserveStock,
    SagaStep, StepOutcome, ValidateOrder,
};

/// A compensation that could not be applied.
#[derive(Debug, Clone, Serialize)]
pub struct CompensationFailure {
    pub compensation: Compensation,
    pub error: String,
}

/// What happened during one settlement run.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub order_number: OrderNumber,
    pub state: SagaState,
    pub completed_steps: Vec<&'static str>,
    pub failed_step: Option<&'static str>,
    /// Compensations applied, in the order they ran.
    pub compensated: Vec<Compensation>,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl SettlementReport {
    fn new(order_number: OrderNumber) -> Self {
        Self {
            order_number,
            state: SagaState::NotStarted,
            completed_steps: Vec::new(),
            failed_step: None,
            compensated: Vec::new(),
            compensation_failures: Vec::new(),
        }
    }

    fn transition(&mut self, allowed: bool, next: SagaState) {
        debug_assert!(allowed, "saga cannot move from {} to {}", self.state, next);
        self.state = next;
    }
}

/// The outcome of a settlement run together with its report.
#[derive(Debug)]
pub struct Settlement {
    pub result: Result<Order>,
    pub report: SettlementReport,
}

/// Creates orders as a sequence of committed steps and cancels them.
///
/// Every step commits on its own, so a failure part way leaves durable
/// effects behind. The driver undoes them by running the collected
/// compensations in reverse.
pub struct SettlementSaga {
    ledger: Arc<dyn LedgerStore>,
    locks: LockCoordinator,
    steps: Vec<Box<dyn SagaStep>>,
    compensator: Arc<dyn Compensator>,
    recorder: Arc<dyn SalesRecorder>,
    config: SettlementConfig,
}

impl SettlementSaga {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        locks: LockCoordinator,
        recorder: Arc<dyn SalesRecorder>,
        config: SettlementConfig,
    ) -> Self {
        let stock = StockService::new(ledger.clone());
        let wallet = WalletService::new(ledger.clone());
        let steps: Vec<Box<dyn SagaStep>> = vec![
            Box::new(ValidateOrder::new(ledger.clone())),
            Box::new(ReserveStock::new(
                stock,
                locks.clone(),
                config.reservation,
                config.lock_wait,
                config.lock_lease,
            )),
            Box::new(PriceLines),
            Box::new(ApplyCoupon::new(ledger.clone())),
            Box::new(DebitWallet::new(wallet)),
            Box::new(ConfirmOrder::new(ledger.clone())),
        ];
        Self {
            compensator: Arc::new(LedgerCompensator::new(ledger.clone())),
            ledger,
            locks,
            steps,
            recorder,
            config,
        }
    }

    /// Replaces how compensations are applied.
    pub fn with_compensator(mut self, compensator: Arc<dyn Compensator>) -> Self {
        self.compensator = compensator;
        self
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Settles an order and returns it.
    pub async fn create_order(&self, request: OrderRequest) -> Result<Order> {
        self.settle(request).await.result
    }

    /// Settles an order and returns the run report alongside the result.
    #[tracing::instrument(
        skip(self, request),
        fields(saga_type = SAGA_TYPE, user_id = %request.user_id, items = request.items.len())
    )]
    pub async fn settle(&self, request: OrderRequest) -> Settlement {
        let started = Instant::now();
        let mut draft = OrderDraft::new(request);
        let mut report = SettlementReport::new(draft.order_number.clone());
        let mut compensations: Vec<Compensation> = Vec::new();

        report.transition(report.state.can_run(), SagaState::Running);

        for step in &self.steps {
            tracing::debug!(step = step.name(), "saga step started");
            match step.execute(draft).await {
                StepOutcome::Advance {
                    draft: next,
                    compensations: undo,
                } => {
                    compensations.extend(undo);
                    report.completed_steps.push(step.name());
                    draft = next;
                }
                StepOutcome::Abort {
                    error,
                    compensations: undo,
                } => {
                    compensations.extend(undo);
                    report.failed_step = Some(step.name());
                    tracing::info!(step = step.name(), error = %error, "saga step aborted");

                    let error = self.compensate(&mut report, compensations, error).await;
                    metrics::counter!("settlement_failures_total", "reason" => error.reason())
                        .increment(1);
                    metrics::histogram!("settlement_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Settlement {
                        result: Err(error),
                        report,
                    };
                }
            }
        }

        report.transition(report.state.can_complete(), SagaState::Completed);
        let duration = started.elapsed().as_secs_f64();
        metrics::histogram!("settlement_duration_seconds").record(duration);

        let result = draft
            .order
            .take()
            .ok_or_else(|| SagaError::OrderNotFound(draft.order_number.to_string()));
        if let Ok(order) = &result {
            metrics::counter!("settlement_orders_total").increment(1);
            tracing::info!(
                order_number = %order.order_number,
                final_amount = %order.final_amount,
                duration,
                "order settled"
            );
            self.record_sales(order);
        }
        Settlement { result, report }
    }

    /// Applies compensations newest first.
    ///
    /// Every compensation is attempted even after one fails. A failure
    /// replaces the original error, since the ledger now needs manual
    /// reconciliation.
    async fn compensate(
        &self,
        report: &mut SettlementReport,
        compensations: Vec<Compensation>,
        error: SagaError,
    ) -> SagaError {
        report.transition(report.state.can_compensate(), SagaState::Compensating);
        let mut escalated = None;

        for compensation in compensations.into_iter().rev() {
            match self.compensator.compensate(&compensation).await {
                Ok(()) => {
                    metrics::counter!("settlement_compensations_total").increment(1);
                    report.compensated.push(compensation);
                }
                Err(e) => {
                    metrics::counter!("settlement_compensation_failures_total").increment(1);
                    tracing::error!(
                        alarm = "ledger_reconciliation_required",
                        order_number = %report.order_number,
                        step = compensation.step(),
                        ?compensation,
                        error = %e,
                        "compensation failed"
                    );
                    escalated.get_or_insert_with(|| SagaError::CompensationFailed {
                        step: compensation.step().to_string(),
                        reason: e.to_string(),
                    });
                    report.compensation_failures.push(CompensationFailure {
                        compensation,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.state = SagaState::Failed;
        tracing::warn!(
            order_number = %report.order_number,
            failed_step = report.failed_step.unwrap_or("unknown"),
            compensated = report.compensated.len(),
            "settlement failed"
        );
        escalated.unwrap_or(error)
    }

    /// Feeds sold quantities to the ranking after commit. Never fails the order.
    fn record_sales(&self, order: &Order) {
        let recorder = self.recorder.clone();
        let sold: Vec<(ProductId, u32)> = order
            .items
            .iter()
            .map(|item| (item.product_id, item.quantity))
            .collect();
        tokio::spawn(async move {
            for (product_id, quantity) in sold {
                if let Err(e) = recorder.record_sale(product_id, quantity).await {
                    tracing::warn!(%product_id, error = %e, "sales telemetry dropped");
                }
            }
        });
    }

    /// Cancels an order and reverses its stock, wallet and coupon effects.
    ///
    /// Runs under the order's coordinator lock, and all effects commit in one
    /// transaction.
    #[tracing::instrument(skip(self), fields(order_number = %number))]
    pub async fn cancel_order(&self, number: &OrderNumber) -> Result<Order> {
        let key = format!("order:{number}");
        self.locks
            .with_lock(&key, self.config.lock_wait, self.config.lock_lease, || {
                self.cancel_locked(number)
            })
            .await
    }

    async fn cancel_locked(&self, number: &OrderNumber) -> Result<Order> {
        let mut tx = self.ledger.begin().await?;
        let mut order = tx
            .lock_order(number)
            .await?
            .ok_or_else(|| SagaError::OrderNotFound(number.to_string()))?;
        order.cancel(Utc::now()).map_err(|e| match e {
            DomainError::AlreadyCancelled(n) => SagaError::AlreadyCancelled(n),
            other => other.into(),
        })?;

        let mut items: Vec<_> = order.items.iter().collect();
        items.sort_by_key(|item| item.product_id);
        for item in items {
            let rows = tx
                .increment(
                    Counter::ProductStock(item.product_id),
                    i64::from(item.quantity),
                )
                .await?;
            if rows == 0 {
                return Err(SagaError::ProductNotFound(item.product_id));
            }
        }

        if order.final_amount.is_positive() {
            let rows = tx
                .increment(
                    Counter::WalletBalance(order.user_id),
                    order.final_amount.amount(),
                )
                .await?;
            if rows == 0 {
                return Err(SagaError::WalletNotFound(order.user_id));
            }
        }

        if let Some(coupon_id) = order.coupon_id
            && let Some(mut issuance) = tx.lock_issuance(coupon_id).await?
        {
            issuance.revert();
            tx.save_issuance(&issuance).await?;
        }

        tx.save_order(&order).await?;
        tx.commit().await?;

        metrics::counter!("order_cancellations_total").increment(1);
        tracing::info!(refunded = %order.final_amount, "order cancelled");
        Ok(order)
    }

    pub async fn get_order(&self, number: &OrderNumber) -> Result<Order> {
        self.ledger
            .find_order(number)
            .await?
            .ok_or_else(|| SagaError::OrderNotFound(number.to_string()))
    }

    pub async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        if self.ledger.find_user(user_id).await?.is_none() {
            return Err(SagaError::UserNotFound(user_id));
        }
        Ok(self.ledger.orders_for_user(user_id).await?)
    }
}
