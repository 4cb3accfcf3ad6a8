//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need Docker.
//! Run with:
//!
//! ```bash
//! cargo test -p ledger --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::Money;
use domain::{
    NewCouponTemplate, NewIssuance, NewOrder, NewProduct, NewUser, NewWorkItem, OrderItem,
    OrderNumber, WorkStatus,
};
use ledger::{Counter, LedgerError, LedgerStore, LedgerStoreExt, PostgresLedger};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_ledger_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh ledger with its own pool and cleared tables
async fn get_test_ledger() -> PostgresLedger {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE order_items, orders, issuances, wallets, products, \
         coupon_templates, work_items, users RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresLedger::new(pool).with_lock_timeout(std::time::Duration::from_millis(500))
}

fn template(name: &str, count: i64) -> NewCouponTemplate {
    NewCouponTemplate {
        name: name.to_string(),
        total_count: count,
        discount_amount: Money::new(1_000),
        min_order_amount: Money::zero(),
        expires_at: Utc::now() + Duration::days(1),
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn conditional_decrement_stops_at_zero() {
    let ledger = get_test_ledger().await;
    let product = ledger
        .insert_product(NewProduct {
            name: "Widget".to_string(),
            price: Money::new(1_000),
            stock: 3,
        })
        .await
        .unwrap();
    let counter = Counter::ProductStock(product.id);

    assert_eq!(ledger.conditional_decrement(counter, 2).await.unwrap(), 1);
    assert_eq!(ledger.conditional_decrement(counter, 2).await.unwrap(), 0);
    assert_eq!(ledger.increment(counter, 4).await.unwrap(), 1);

    let stock = ledger.find_product(product.id).await.unwrap().unwrap().stock;
    assert_eq!(stock, 5);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn view_counts_rank_products() {
    let ledger = get_test_ledger().await;
    let mut ids = Vec::new();
    for name in ["Quiet", "Popular"] {
        let product = ledger
            .insert_product(NewProduct {
                name: name.to_string(),
                price: Money::new(1_000),
                stock: 1,
            })
            .await
            .unwrap();
        assert_eq!(product.view_count, 0);
        ids.push(product.id);
    }

    for _ in 0..3 {
        ledger
            .increment(Counter::ProductViews(ids[1]), 1)
            .await
            .unwrap();
    }

    let top = ledger.most_viewed_products(1).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!((top[0].id, top[0].view_count), (ids[1], 3));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn duplicate_issuance_hits_unique_index() {
    let ledger = get_test_ledger().await;
    let user = ledger.insert_user(NewUser::new("alice")).await.unwrap();
    let t = ledger.insert_template(template("WELCOME", 5)).await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    tx.insert_issuance(NewIssuance::new(t.id, user.id, Utc::now()))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let err = tx
        .insert_issuance(NewIssuance::new(t.id, user.id, Utc::now()))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::UniqueViolation(ref c) if c == "uq_issuances_template_user"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn row_lock_wait_times_out() {
    let ledger = get_test_ledger().await;
    let user = ledger.insert_user(NewUser::new("bob")).await.unwrap();
    ledger.insert_wallet(user.id, Money::new(100)).await.unwrap();

    let mut holder = ledger.begin().await.unwrap();
    holder.lock_wallet(user.id).await.unwrap().unwrap();

    let mut waiter = ledger.begin().await.unwrap();
    let err = waiter.lock_wallet(user.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::LockTimeout(_)));
    holder.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn orders_roundtrip_with_items() {
    let ledger = get_test_ledger().await;
    let user = ledger.insert_user(NewUser::new("carol")).await.unwrap();
    let product = ledger
        .insert_product(NewProduct {
            name: "Gadget".to_string(),
            price: Money::new(2_500),
            stock: 10,
        })
        .await
        .unwrap();

    let number = OrderNumber::generate();
    let mut tx = ledger.begin().await.unwrap();
    tx.insert_order(NewOrder {
        order_number: number.clone(),
        user_id: user.id,
        items: vec![OrderItem::new(product.id, "Gadget", Money::new(2_500), 2)],
        coupon_id: None,
        total_amount: Money::new(5_000),
        discount_amount: Money::zero(),
        ordered_at: Utc::now(),
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let order = ledger.find_order(&number).await.unwrap().unwrap();
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.final_amount, Money::new(5_000));

    let sales = ledger
        .product_sales_since(Utc::now() - Duration::days(7))
        .await
        .unwrap();
    assert_eq!(sales[0].quantity, 2);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn work_queue_is_fifo_and_deduplicated() {
    let ledger = get_test_ledger().await;
    let t0 = Utc::now();
    let first = ledger
        .insert_work_item(NewWorkItem::new(common::UserId::new(1), "FLASH", t0))
        .await
        .unwrap();
    ledger
        .insert_work_item(NewWorkItem::new(
            common::UserId::new(2),
            "FLASH",
            t0 + Duration::milliseconds(5),
        ))
        .await
        .unwrap();

    let dup = ledger
        .insert_work_item(NewWorkItem::new(common::UserId::new(1), "FLASH", t0))
        .await
        .unwrap_err();
    assert!(dup.is_unique_violation());

    let mut tx = ledger.begin().await.unwrap();
    let mut item = tx.lock_next_work_item().await.unwrap().unwrap();
    assert_eq!(item.id, first.id);
    item.start_processing(Utc::now()).unwrap();
    tx.save_work_item(&item).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        ledger.count_work_items(WorkStatus::Processing).await.unwrap(),
        1
    );
    assert_eq!(ledger.count_work_items(WorkStatus::Pending).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn concurrent_decrements_never_oversell() {
    let ledger = Arc::new(get_test_ledger().await);
    let t = ledger.insert_template(template("FLASH", 10)).await.unwrap();

    let tasks = (0..30).map(|_| {
        let ledger = ledger.clone();
        async move {
            ledger
                .conditional_decrement(Counter::CouponRemaining(t.id), 1)
                .await
                .unwrap()
        }
    });
    let granted: u64 = futures_util::future::join_all(tasks).await.into_iter().sum();

    assert_eq!(granted, 10);
    let remaining = ledger.find_template(t.id).await.unwrap().unwrap().remaining_count;
    assert_eq!(remaining, 0);
}
