//! End-to-end settlement tests against the in-memory ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{IssuanceId, Money, ProductId, UserId};
use coordination::LockCoordinator;
use domain::{DomainError, NewCouponTemplate, NewIssuance, NewProduct, OrderNumber};
use ledger::{InMemoryLedger, LedgerStore};
use ranking::{RankingError, SalesRanking, SalesRecorder};
use saga::{
    Compensation, Compensator, LedgerCompensator, OrderLine, OrderRequest, ReservationMode,
    SagaError, SagaState, SettlementConfig, SettlementSaga, StockService, WalletService,
};

struct Fixture {
    ledger: Arc<InMemoryLedger>,
    saga: SettlementSaga,
    stock: StockService,
    wallet: WalletService,
    ranking: SalesRanking,
}

impl Fixture {
    fn new(mode: ReservationMode) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let ranking = SalesRanking::new(ledger.clone());
        let config = SettlementConfig {
            reservation: mode,
            ..SettlementConfig::default()
        };
        Self {
            saga: SettlementSaga::new(
                ledger.clone(),
                LockCoordinator::in_memory(),
                Arc::new(ranking.clone()),
                config,
            ),
            stock: StockService::new(ledger.clone()),
            wallet: WalletService::new(ledger.clone()),
            ranking,
            ledger,
        }
    }

    fn with_saga(mut self, saga: SettlementSaga) -> Self {
        self.saga = saga;
        self
    }

    async fn product(&self, name: &str, price: i64, stock: i64) -> ProductId {
        self.stock
            .create_product(NewProduct {
                name: name.to_string(),
                price: Money::new(price),
                stock,
            })
            .await
            .unwrap()
            .id
    }

    async fn customer(&self, balance: i64) -> UserId {
        self.wallet
            .open_account("customer", Money::new(balance))
            .await
            .unwrap()
            .0
            .id
    }

    async fn coupon(
        &self,
        user_id: UserId,
        discount: i64,
        minimum: i64,
        expires_in: chrono::Duration,
    ) -> IssuanceId {
        let template = self
            .ledger
            .insert_template(NewCouponTemplate {
                name: format!("PROMO-{}", unique_suffix()),
                total_count: 10,
                discount_amount: Money::new(discount),
                min_order_amount: Money::new(minimum),
                expires_at: Utc::now() + expires_in,
            })
            .await
            .unwrap();
        let mut tx = self.ledger.begin().await.unwrap();
        let issuance = tx
            .insert_issuance(NewIssuance::new(template.id, user_id, Utc::now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        issuance.id
    }

    async fn coupon_used(&self, id: IssuanceId) -> bool {
        self.ledger.find_issuance(id).await.unwrap().unwrap().used
    }
}

fn unique_suffix() -> String {
    OrderNumber::generate().as_str().replace("ORD-", "")
}

fn request(user_id: UserId, items: &[(ProductId, u32)], coupon_id: Option<IssuanceId>) -> OrderRequest {
    OrderRequest {
        user_id,
        items: items
            .iter()
            .map(|&(product_id, quantity)| OrderLine {
                product_id,
                quantity,
            })
            .collect(),
        coupon_id,
    }
}

mod create {
    use super::*;

    #[tokio::test]
    async fn settles_order_and_debits_wallet() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let keyboard = fx.product("Keyboard", 10_000, 5).await;
        let user = fx.customer(50_000).await;

        let settlement = fx.saga.settle(request(user, &[(keyboard, 2)], None)).await;
        let order = settlement.result.unwrap();

        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].product_name, "Keyboard");
        assert_eq!(order.total_amount, Money::new(20_000));
        assert_eq!(order.final_amount, Money::new(20_000));
        assert_eq!(fx.stock.stock(keyboard).await.unwrap(), 3);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(30_000));

        let report = settlement.report;
        assert_eq!(report.state, SagaState::Completed);
        assert_eq!(report.order_number, order.order_number);
        assert_eq!(
            report.completed_steps,
            [
                "validate",
                "reserve_stock",
                "price_lines",
                "apply_coupon",
                "debit_wallet",
                "confirm"
            ]
        );
        assert!(report.compensated.is_empty());

        let stored = fx.saga.get_order(&order.order_number).await.unwrap();
        assert_eq!(stored, order);
    }

    #[tokio::test]
    async fn captured_price_survives_later_changes() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let mouse = fx.product("Mouse", 8_000, 10).await;
        let user = fx.customer(100_000).await;

        let order = fx
            .saga
            .create_order(request(user, &[(mouse, 1)], None))
            .await
            .unwrap();
        fx.stock.add_stock(mouse, 5).await.unwrap();

        let stored = fx.saga.get_order(&order.order_number).await.unwrap();
        assert_eq!(stored.items[0].unit_price, Money::new(8_000));
    }

    #[tokio::test]
    async fn rejects_bad_requests_before_touching_stock() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let p = fx.product("Cable", 1_000, 5).await;
        let user = fx.customer(10_000).await;

        let err = fx
            .saga
            .create_order(request(UserId::new(404), &[(p, 1)], None))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::UserNotFound(_)));

        let err = fx.saga.create_order(request(user, &[], None)).await.unwrap_err();
        assert!(matches!(err, SagaError::EmptyOrder));

        let err = fx
            .saga
            .create_order(request(user, &[(p, 0)], None))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidQuantity { quantity: 0, .. }));

        let err = fx
            .saga
            .create_order(request(user, &[(ProductId::new(999), 1)], None))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::ProductNotFound(_)));

        assert_eq!(fx.stock.stock(p).await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_never_oversell() {
        let fx = Arc::new(Fixture::new(ReservationMode::Conditional));
        let p = fx.product("Limited", 1_000, 5).await;
        let mut users = Vec::new();
        for _ in 0..12 {
            users.push(fx.customer(10_000).await);
        }

        let tasks = users.into_iter().map(|user| {
            let fx = fx.clone();
            async move { fx.saga.create_order(request(user, &[(p, 1)], None)).await }
        });
        let results = futures_util::future::join_all(tasks).await;

        let settled = results.iter().filter(|r| r.is_ok()).count();
        let short = results
            .iter()
            .filter(|r| matches!(r, Err(SagaError::InsufficientStock { .. })))
            .count();
        assert_eq!(settled, 5);
        assert_eq!(short, 7);
        assert_eq!(fx.stock.stock(p).await.unwrap(), 0);
    }
}

mod compensation {
    use super::*;

    #[tokio::test]
    async fn insufficient_balance_restores_all_stock() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let monitor = fx.product("Monitor", 60_000, 3).await;
        let stand = fx.product("Stand", 30_000, 4).await;
        let user = fx.customer(100_000).await;

        let settlement = fx
            .saga
            .settle(request(user, &[(monitor, 1), (stand, 2)], None))
            .await;

        let err = settlement.result.unwrap_err();
        assert!(matches!(
            err,
            SagaError::InsufficientBalance { required, .. } if required == Money::new(120_000)
        ));
        assert_eq!(fx.stock.stock(monitor).await.unwrap(), 3);
        assert_eq!(fx.stock.stock(stand).await.unwrap(), 4);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(100_000));
        assert!(fx.saga.orders_for_user(user).await.unwrap().is_empty());

        let report = settlement.report;
        assert_eq!(report.state, SagaState::Failed);
        assert_eq!(report.failed_step, Some("debit_wallet"));
        assert_eq!(
            report.compensated,
            [
                Compensation::RestoreStock {
                    product_id: stand,
                    quantity: 2
                },
                Compensation::RestoreStock {
                    product_id: monitor,
                    quantity: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn short_item_restores_items_already_taken() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let a = fx.product("A", 1_000, 5).await;
        let b = fx.product("B", 1_000, 1).await;
        let user = fx.customer(100_000).await;

        let settlement = fx.saga.settle(request(user, &[(a, 2), (b, 3)], None)).await;

        assert!(matches!(
            settlement.result,
            Err(SagaError::InsufficientStock { product_id, requested: 3 }) if product_id == b
        ));
        assert_eq!(settlement.report.failed_step, Some("reserve_stock"));
        assert_eq!(settlement.report.compensated.len(), 1);
        assert_eq!(fx.stock.stock(a).await.unwrap(), 5);
        assert_eq!(fx.stock.stock(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn coupon_is_reverted_when_wallet_debit_fails() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let p = fx.product("Chair", 20_000, 2).await;
        let user = fx.customer(10_000).await;
        let coupon = fx
            .coupon(user, 5_000, 10_000, chrono::Duration::days(1))
            .await;

        let err = fx
            .saga
            .create_order(request(user, &[(p, 1)], Some(coupon)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::InsufficientBalance { required, .. } if required == Money::new(15_000)
        ));
        assert!(!fx.coupon_used(coupon).await);
        assert_eq!(fx.stock.stock(p).await.unwrap(), 2);

        fx.wallet.charge(user, Money::new(5_000)).await.unwrap();
        let order = fx
            .saga
            .create_order(request(user, &[(p, 1)], Some(coupon)))
            .await
            .unwrap();
        assert_eq!(order.discount_amount, Money::new(5_000));
        assert_eq!(order.final_amount, Money::new(15_000));
        assert!(fx.coupon_used(coupon).await);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::zero());
    }

    /// Applies compensations through the ledger unless stock restores are
    /// switched off.
    struct FlakyCompensator {
        inner: LedgerCompensator,
        fail_restock: AtomicBool,
    }

    #[async_trait]
    impl Compensator for FlakyCompensator {
        async fn compensate(&self, compensation: &Compensation) -> saga::Result<()> {
            if self.fail_restock.load(Ordering::SeqCst)
                && matches!(compensation, Compensation::RestoreStock { .. })
            {
                return Err(SagaError::ProductNotFound(ProductId::new(0)));
            }
            self.inner.compensate(compensation).await
        }
    }

    #[tokio::test]
    async fn failed_compensation_escalates() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let compensator = Arc::new(FlakyCompensator {
            inner: LedgerCompensator::new(fx.ledger.clone()),
            fail_restock: AtomicBool::new(true),
        });
        let saga = SettlementSaga::new(
            fx.ledger.clone(),
            LockCoordinator::in_memory(),
            Arc::new(ranking::NoopSalesRecorder),
            SettlementConfig::default(),
        )
        .with_compensator(compensator);
        let fx = fx.with_saga(saga);

        let p = fx.product("Desk", 50_000, 2).await;
        let user = fx.customer(10_000).await;
        let coupon = fx.coupon(user, 1_000, 0, chrono::Duration::days(1)).await;

        let settlement = fx.saga.settle(request(user, &[(p, 1)], Some(coupon))).await;

        assert!(matches!(
            settlement.result,
            Err(SagaError::CompensationFailed { ref step, .. }) if step == "reserve_stock"
        ));
        let report = settlement.report;
        assert_eq!(report.state, SagaState::Failed);
        assert_eq!(report.compensation_failures.len(), 1);
        // The remaining compensations still ran.
        assert_eq!(
            report.compensated,
            [Compensation::RevertCoupon { coupon_id: coupon }]
        );
        assert!(!fx.coupon_used(coupon).await);
        assert_eq!(fx.stock.stock(p).await.unwrap(), 1);
    }
}

mod limits {
    use super::*;

    #[tokio::test]
    async fn overflowing_total_is_rejected_and_stock_restored() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let p = fx.product("Bullion", 1 << 62, 2).await;
        let user = fx.customer(1_000).await;

        let settlement = fx.saga.settle(request(user, &[(p, 2)], None)).await;

        let err = settlement.result.unwrap_err();
        assert_eq!(err.kind(), domain::ErrorKind::Validation);
        assert_eq!(settlement.report.failed_step, Some("price_lines"));
        assert_eq!(fx.stock.stock(p).await.unwrap(), 2);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(1_000));
        assert!(fx.saga.orders_for_user(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_product_leaves_every_stock_untouched() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let a = fx.product("A", 1_000, 5).await;
        let b = fx.product("B", 1_000, 4).await;
        let user = fx.customer(10_000).await;

        fx.ledger.set_fail_product_reads(Some(b));
        let settlement = fx.saga.settle(request(user, &[(a, 1), (b, 2)], None)).await;
        fx.ledger.set_fail_product_reads(None);

        assert!(matches!(settlement.result, Err(SagaError::Ledger(_))));
        assert_eq!(settlement.report.failed_step, Some("reserve_stock"));
        assert_eq!(fx.stock.stock(a).await.unwrap(), 5);
        assert_eq!(fx.stock.stock(b).await.unwrap(), 4);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(10_000));
        assert!(fx.saga.orders_for_user(user).await.unwrap().is_empty());
    }
}

mod coupons {
    use super::*;

    #[tokio::test]
    async fn foreign_coupon_is_not_found() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let p = fx.product("Lamp", 10_000, 5).await;
        let owner = fx.customer(50_000).await;
        let other = fx.customer(50_000).await;
        let coupon = fx.coupon(owner, 1_000, 0, chrono::Duration::days(1)).await;

        let err = fx
            .saga
            .create_order(request(other, &[(p, 1)], Some(coupon)))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::CouponNotFound(id) if id == coupon));
        assert_eq!(fx.stock.stock(p).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unusable_coupons_are_rejected_with_reason() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let p = fx.product("Pen", 5_000, 10).await;
        let user = fx.customer(100_000).await;

        let high_minimum = fx.coupon(user, 1_000, 50_000, chrono::Duration::days(1)).await;
        let err = fx
            .saga
            .create_order(request(user, &[(p, 1)], Some(high_minimum)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::CouponNotUsable {
                reason: DomainError::BelowMinimumOrder { .. },
                ..
            }
        ));

        let expired = fx.coupon(user, 1_000, 0, chrono::Duration::seconds(-1)).await;
        let err = fx
            .saga
            .create_order(request(user, &[(p, 1)], Some(expired)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::CouponNotUsable {
                reason: DomainError::CouponExpired,
                ..
            }
        ));

        let once = fx.coupon(user, 1_000, 0, chrono::Duration::days(1)).await;
        fx.saga
            .create_order(request(user, &[(p, 1)], Some(once)))
            .await
            .unwrap();
        let err = fx
            .saga
            .create_order(request(user, &[(p, 1)], Some(once)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::CouponNotUsable {
                reason: DomainError::CouponAlreadyUsed,
                ..
            }
        ));

        assert_eq!(fx.stock.stock(p).await.unwrap(), 9);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(96_000));
    }
}

mod cancel {
    use super::*;

    #[tokio::test]
    async fn create_then_cancel_is_net_neutral() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let a = fx.product("A", 7_000, 4).await;
        let b = fx.product("B", 3_000, 4).await;
        let user = fx.customer(40_000).await;
        let coupon = fx.coupon(user, 2_000, 0, chrono::Duration::days(1)).await;

        let order = fx
            .saga
            .create_order(request(user, &[(b, 1), (a, 2)], Some(coupon)))
            .await
            .unwrap();
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(25_000));

        let cancelled = fx.saga.cancel_order(&order.order_number).await.unwrap();
        assert!(cancelled.is_cancelled());

        assert_eq!(fx.stock.stock(a).await.unwrap(), 4);
        assert_eq!(fx.stock.stock(b).await.unwrap(), 4);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(40_000));
        assert!(!fx.coupon_used(coupon).await);

        let err = fx.saga.cancel_order(&order.order_number).await.unwrap_err();
        assert!(matches!(err, SagaError::AlreadyCancelled(_)));
        assert_eq!(fx.stock.stock(a).await.unwrap(), 4);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(40_000));

        let stored = fx.saga.get_order(&order.order_number).await.unwrap();
        assert!(stored.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let err = fx
            .saga
            .cancel_order(&OrderNumber::from("ORD-MISSING0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::OrderNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cancels_apply_once() {
        let fx = Arc::new(Fixture::new(ReservationMode::Conditional));
        let p = fx.product("Bag", 5_000, 3).await;
        let user = fx.customer(5_000).await;
        let order = fx
            .saga
            .create_order(request(user, &[(p, 1)], None))
            .await
            .unwrap();

        let tasks = (0..4).map(|_| {
            let fx = fx.clone();
            let number = order.order_number.clone();
            async move { fx.saga.cancel_order(&number).await }
        });
        let results = futures_util::future::join_all(tasks).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(fx.stock.stock(p).await.unwrap(), 3);
        assert_eq!(fx.wallet.balance(user).await.unwrap(), Money::new(5_000));
    }
}

mod sorted_locks {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn crossed_item_orders_do_not_deadlock() {
        let fx = Arc::new(Fixture::new(ReservationMode::SortedLocks));
        let a = fx.product("A", 1_000, 100).await;
        let b = fx.product("B", 1_000, 100).await;
        let mut users = Vec::new();
        for _ in 0..20 {
            users.push(fx.customer(10_000).await);
        }

        let tasks = users.into_iter().enumerate().map(|(i, user)| {
            let fx = fx.clone();
            let items = if i % 2 == 0 {
                [(a, 1), (b, 2)]
            } else {
                [(b, 2), (a, 1)]
            };
            async move { fx.saga.create_order(request(user, &items, None)).await }
        });
        let results = tokio::time::timeout(
            Duration::from_secs(20),
            futures_util::future::join_all(tasks),
        )
        .await
        .expect("orders deadlocked");

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(fx.stock.stock(a).await.unwrap(), 80);
        assert_eq!(fx.stock.stock(b).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn snapshot_lines_follow_request_order() {
        let fx = Fixture::new(ReservationMode::SortedLocks);
        let a = fx.product("A", 1_000, 5).await;
        let b = fx.product("B", 2_000, 5).await;
        let user = fx.customer(10_000).await;

        let order = fx
            .saga
            .create_order(request(user, &[(b, 1), (a, 2)], None))
            .await
            .unwrap();

        let names: Vec<_> = order.items.iter().map(|i| i.product_name.as_str()).collect();
        assert_eq!(names, ["B", "A"]);
        assert_eq!(order.total_amount, Money::new(4_000));
    }

    #[tokio::test]
    async fn short_stock_takes_nothing() {
        let fx = Fixture::new(ReservationMode::SortedLocks);
        let a = fx.product("A", 1_000, 5).await;
        let b = fx.product("B", 1_000, 1).await;
        let user = fx.customer(10_000).await;

        let settlement = fx.saga.settle(request(user, &[(a, 1), (b, 2)], None)).await;

        assert!(matches!(
            settlement.result,
            Err(SagaError::InsufficientStock { .. })
        ));
        assert!(settlement.report.compensated.is_empty());
        assert_eq!(fx.stock.stock(a).await.unwrap(), 5);
    }
}

mod sales_telemetry {
    use super::*;

    #[tokio::test]
    async fn committed_orders_reach_the_ranking() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let p = fx.product("Hot", 1_000, 10).await;
        let user = fx.customer(10_000).await;

        fx.saga
            .create_order(request(user, &[(p, 3)], None))
            .await
            .unwrap();

        let mut top = Vec::new();
        for _ in 0..100 {
            top = fx.ranking.top(10).await.unwrap();
            if !top.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(top[0].product_id, p);
        assert_eq!(top[0].units_sold, 3);
    }

    struct BrokenRecorder;

    #[async_trait]
    impl SalesRecorder for BrokenRecorder {
        async fn record_sale(&self, _: ProductId, _: u32) -> ranking::Result<()> {
            Err(RankingError::InvalidLimit)
        }
    }

    #[tokio::test]
    async fn telemetry_failures_do_not_fail_the_order() {
        let fx = Fixture::new(ReservationMode::Conditional);
        let saga = SettlementSaga::new(
            fx.ledger.clone(),
            LockCoordinator::in_memory(),
            Arc::new(BrokenRecorder),
            SettlementConfig::default(),
        );
        let fx = fx.with_saga(saga);
        let p = fx.product("Quiet", 1_000, 10).await;
        let user = fx.customer(10_000).await;

        let order = fx
            .saga
            .create_order(request(user, &[(p, 1)], None))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        assert!(fx.saga.get_order(&order.order_number).await.is_ok());
    }
}
