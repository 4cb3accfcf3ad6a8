use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use common::ProductId;
use coordination::{LockCoordinator, LockGuard};

use super::{OrderDraft, SagaStep, StepOutcome};
use crate::compensation::Compensation;
use crate::config::ReservationMode;
use crate::error::Result;
use crate::order_settlement::STEP_RESERVE_STOCK;
use crate::services::StockService;

/// Takes stock for every requested line.
pub struct ReserveStock {
    stock: StockService,
    locks: LockCoordinator,
    mode: ReservationMode,
    lock_wait: Duration,
    lock_lease: Duration,
}

impl ReserveStock {
    pub fn new(
        stock: StockService,
        locks: LockCoordinator,
        mode: ReservationMode,
        lock_wait: Duration,
        lock_lease: Duration,
    ) -> Self {
        Self {
            stock,
            locks,
            mode,
            lock_wait,
            lock_lease,
        }
    }

    /// Decrements each line on its own. A short line aborts the rest and
    /// hands back restores for the lines already taken.
    async fn reserve_each(&self, mut draft: OrderDraft) -> StepOutcome {
        let mut compensations = Vec::with_capacity(draft.request.items.len());
        for line in draft.request.items.clone() {
            let quantity = i64::from(line.quantity);
            match self.stock.remove_stock(line.product_id, quantity).await {
                Ok(snapshot) => {
                    compensations.push(Compensation::RestoreStock {
                        product_id: line.product_id,
                        quantity,
                    });
                    draft.reserved.push((snapshot, line.quantity));
                }
                Err(error) => {
                    return StepOutcome::Abort {
                        error,
                        compensations,
                    };
                }
            }
        }
        StepOutcome::Advance {
            draft,
            compensations,
        }
    }

    /// Locks every product in ascending id order, then takes all stock in
    /// one transaction.
    async fn reserve_sorted(&self, mut draft: OrderDraft) -> StepOutcome {
        let mut wanted: BTreeMap<ProductId, i64> = BTreeMap::new();
        for line in &draft.request.items {
            *wanted.entry(line.product_id).or_default() += i64::from(line.quantity);
        }
        let wanted: Vec<(ProductId, i64)> = wanted.into_iter().collect();

        let result = self.take_sorted(&wanted).await;
        let snapshots = match result {
            Ok(snapshots) => snapshots,
            Err(error) => {
                return StepOutcome::Abort {
                    error,
                    compensations: Vec::new(),
                };
            }
        };

        let by_id: HashMap<ProductId, _> = snapshots.into_iter().map(|p| (p.id, p)).collect();
        draft.reserved = draft
            .request
            .items
            .iter()
            .filter_map(|line| {
                by_id
                    .get(&line.product_id)
                    .map(|p| (p.clone(), line.quantity))
            })
            .collect();

        let compensations = wanted
            .into_iter()
            .map(|(product_id, quantity)| Compensation::RestoreStock {
                product_id,
                quantity,
            })
            .collect();
        StepOutcome::Advance {
            draft,
            compensations,
        }
    }

    async fn take_sorted(&self, wanted: &[(ProductId, i64)]) -> Result<Vec<domain::Product>> {
        let mut guards: Vec<LockGuard> = Vec::with_capacity(wanted.len());
        for (product_id, _) in wanted {
            let key = format!("product:{product_id}");
            guards.push(
                self.locks
                    .acquire(&key, self.lock_wait, self.lock_lease)
                    .await?,
            );
        }

        let result = self.stock.remove_stock_locked(wanted).await;

        for guard in guards.into_iter().rev() {
            let key = guard.key().to_string();
            if let Err(e) = guard.release().await {
                tracing::warn!(key, error = %e, "product lock release failed; lease will expire");
            }
        }
        result
    }
}

#[async_trait]
impl SagaStep for ReserveStock {
    fn name(&self) -> &'static str {
        STEP_RESERVE_STOCK
    }

    async fn execute(&self, draft: OrderDraft) -> StepOutcome {
        match self.mode {
            ReservationMode::Conditional => self.reserve_each(draft).await,
            ReservationMode::SortedLocks => self.reserve_sorted(draft).await,
        }
    }
}
