//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use allocation::CouponStrategy;
use api::{AppState, Config};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup_with(strategy: CouponStrategy) -> (axum::Router, Arc<AppState>) {
    let config = Config {
        coupon_strategy: strategy,
        ..Config::default()
    };
    let state = Arc::new(AppState::in_memory(config));
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn setup() -> (axum::Router, Arc<AppState>) {
    setup_with(CouponStrategy::Conditional)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn open_account(app: &axum::Router, name: &str, balance: i64) -> i64 {
    let (status, json) = send(
        app,
        "POST",
        "/accounts",
        Some(json!({ "name": name, "initial_balance": balance })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json["user"]["id"].as_i64().unwrap()
}

async fn create_product(app: &axum::Router, price: i64, stock: i64) -> i64 {
    let (status, json) = send(
        app,
        "POST",
        "/products",
        Some(json!({ "name": "Keyboard", "price": price, "stock": stock })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json["id"].as_i64().unwrap()
}

async fn create_template(app: &axum::Router, name: &str, total: i64) {
    let expires_at = chrono::Utc::now() + chrono::Duration::days(1);
    let (status, _) = send(
        app,
        "POST",
        "/coupons/templates",
        Some(json!({
            "name": name,
            "total_count": total,
            "discount_amount": 1_000,
            "expires_at": expires_at,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = setup();
        let (status, json) = send(&app, "GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["coupon_strategy"], "conditional");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = setup();
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}

mod coupons {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_template() {
        let (app, _) = setup();
        create_template(&app, "WELCOME", 3).await;

        let (status, json) = send(&app, "GET", "/coupons/templates/WELCOME", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["remaining_count"], 3);
    }

    #[tokio::test]
    async fn test_duplicate_template_name_conflicts() {
        let (app, _) = setup();
        create_template(&app, "WELCOME", 3).await;

        let expires_at = chrono::Utc::now() + chrono::Duration::days(1);
        let (status, json) = send(
            &app,
            "POST",
            "/coupons/templates",
            Some(json!({
                "name": "WELCOME",
                "total_count": 1,
                "discount_amount": 500,
                "expires_at": expires_at,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["kind"], "conflict");
    }

    #[tokio::test]
    async fn test_issue_then_duplicate_then_sold_out() {
        let (app, _) = setup();
        create_template(&app, "FLASH", 1).await;
        let alice = open_account(&app, "alice", 0).await;
        let bob = open_account(&app, "bob", 0).await;

        let issue = |user: i64| json!({ "user_id": user, "template_name": "FLASH" });

        let (status, json) = send(&app, "POST", "/coupons/issue", Some(issue(alice))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["outcome"], "issued");

        let (status, _) = send(&app, "POST", "/coupons/issue", Some(issue(alice))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, "POST", "/coupons/issue", Some(issue(bob))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) = send(&app, "GET", &format!("/users/{alice}/coupons"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_template_is_not_found() {
        let (app, _) = setup();
        let alice = open_account(&app, "alice", 0).await;

        let (status, json) = send(
            &app,
            "POST",
            "/coupons/issue",
            Some(json!({ "user_id": alice, "template_name": "NOPE" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");
    }
}

mod queue {
    use super::*;

    #[tokio::test]
    async fn test_queued_issue_is_accepted_and_processed() {
        let (app, state) = setup_with(CouponStrategy::Queue);
        create_template(&app, "FLASH", 5).await;
        let alice = open_account(&app, "alice", 0).await;

        let (status, json) = send(
            &app,
            "POST",
            "/coupons/issue",
            Some(json!({ "user_id": alice, "template_name": "FLASH" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["outcome"], "enqueued");
        let id = json["id"].as_i64().unwrap();

        let (_, summary) = send(&app, "GET", "/coupons/queue/summary", None).await;
        assert_eq!(summary["pending"], 1);

        state.queue.process_next().await.unwrap();

        let (status, item) = send(&app, "GET", &format!("/coupons/queue/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_unknown_work_item_is_not_found() {
        let (app, _) = setup();
        let (status, _) = send(&app, "GET", "/coupons/queue/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_waiting_list_reports_position() {
        let (app, _) = setup_with(CouponStrategy::WaitingList);
        create_template(&app, "FLASH", 5).await;
        let alice = open_account(&app, "alice", 0).await;

        let (status, json) = send(
            &app,
            "POST",
            "/coupons/issue",
            Some(json!({ "user_id": alice, "template_name": "FLASH" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["outcome"], "waiting");

        let (status, json) = send(
            &app,
            "GET",
            &format!("/coupons/waiting/FLASH/users/{alice}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["position"], 0);
        assert_eq!(json["size"], 1);
    }
}

mod wallets {
    use super::*;

    #[tokio::test]
    async fn test_charge_and_withdraw() {
        let (app, _) = setup();
        let alice = open_account(&app, "alice", 1_000).await;

        let (status, json) = send(
            &app,
            "POST",
            &format!("/wallets/{alice}/charge"),
            Some(json!({ "amount": 500 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["balance"], 1_500);

        let (status, json) = send(
            &app,
            "POST",
            &format!("/wallets/{alice}/withdraw"),
            Some(json!({ "amount": 5_000 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["kind"], "conflict");

        let (_, json) = send(&app, "GET", &format!("/wallets/{alice}"), None).await;
        assert_eq!(json["balance"], 1_500);
    }

    #[tokio::test]
    async fn test_unknown_wallet_is_not_found() {
        let (app, _) = setup();
        let (status, _) = send(&app, "GET", "/wallets/404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

mod orders {
    use super::*;

    #[tokio::test]
    async fn test_create_get_and_cancel_order() {
        let (app, _) = setup();
        let alice = open_account(&app, "alice", 10_000).await;
        let product = create_product(&app, 2_000, 5).await;

        let (status, order) = send(
            &app,
            "POST",
            "/orders",
            Some(json!({
                "user_id": alice,
                "items": [{ "product_id": product, "quantity": 2 }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["final_amount"], 4_000);
        let number = order["order_number"].as_str().unwrap().to_string();

        let (_, wallet) = send(&app, "GET", &format!("/wallets/{alice}"), None).await;
        assert_eq!(wallet["balance"], 6_000);

        let (status, fetched) = send(&app, "GET", &format!("/orders/{number}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["order_number"], number.as_str());

        let (status, cancelled) =
            send(&app, "POST", &format!("/orders/{number}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!cancelled["cancelled_at"].is_null());

        let (_, wallet) = send(&app, "GET", &format!("/wallets/{alice}"), None).await;
        assert_eq!(wallet["balance"], 10_000);
        let (_, stock) = send(&app, "GET", &format!("/products/{product}"), None).await;
        assert_eq!(stock["stock"], 5);

        let (status, _) = send(&app, "POST", &format!("/orders/{number}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_conflict() {
        let (app, _) = setup();
        let alice = open_account(&app, "alice", 100_000).await;
        let product = create_product(&app, 1_000, 1).await;

        let (status, json) = send(
            &app,
            "POST",
            "/orders",
            Some(json!({
                "user_id": alice,
                "items": [{ "product_id": product, "quantity": 3 }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["kind"], "conflict");

        let (_, json) = send(&app, "GET", &format!("/users/{alice}/orders"), None).await;
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overflowing_order_total_is_bad_request() {
        let (app, _) = setup();
        let alice = open_account(&app, "alice", 1_000).await;
        let product = create_product(&app, 1 << 62, 2).await;

        let (status, _) = send(
            &app,
            "POST",
            "/orders",
            Some(json!({
                "user_id": alice,
                "items": [{ "product_id": product, "quantity": 2 }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, json) = send(&app, "GET", &format!("/products/{product}"), None).await;
        assert_eq!(json["stock"], 2);
    }

    #[tokio::test]
    async fn test_empty_order_is_bad_request() {
        let (app, _) = setup();
        let alice = open_account(&app, "alice", 100).await;

        let (status, _) = send(
            &app,
            "POST",
            "/orders",
            Some(json!({ "user_id": alice, "items": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let (app, _) = setup();
        let (status, _) = send(&app, "GET", "/orders/ORD-MISSING", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

mod products {
    use super::*;

    #[tokio::test]
    async fn test_stock_adjustments() {
        let (app, _) = setup();
        let product = create_product(&app, 500, 2).await;

        let (status, json) = send(
            &app,
            "POST",
            &format!("/products/{product}/stock/add"),
            Some(json!({ "quantity": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stock"], 5);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/products/{product}/stock/remove"),
            Some(json!({ "quantity": 6 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_top_products() {
        let (app, state) = setup();
        let alice = open_account(&app, "alice", 1_000_000).await;
        let mouse = create_product(&app, 100, 50).await;
        let monitor = create_product(&app, 100, 50).await;

        for (product, quantity) in [(mouse, 2), (monitor, 7)] {
            let (status, _) = send(
                &app,
                "POST",
                "/orders",
                Some(json!({
                    "user_id": alice,
                    "items": [{ "product_id": product, "quantity": quantity }],
                })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        // let the spawned sale recordings finish before the resync replaces them
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        state.ranking.resync().await.unwrap();

        let (status, json) = send(&app, "GET", "/products/top?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let ranked = json.as_array().unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0]["product_id"], monitor);
        assert_eq!(ranked[0]["units_sold"], 7);

        let (status, _) = send(&app, "GET", "/products/top?limit=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_most_viewed_products() {
        let (app, _) = setup();
        let lamp = create_product(&app, 100, 1).await;
        let desk = create_product(&app, 100, 1).await;

        for product in [desk, desk, lamp] {
            let (status, _) = send(&app, "POST", &format!("/products/{product}/views"), None).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }

        let (status, json) = send(&app, "GET", "/products/most-viewed?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let top = json.as_array().unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0]["id"], desk);
        assert_eq!(top[0]["view_count"], 2);

        let (status, _) = send(&app, "GET", "/products/most-viewed?limit=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "POST", "/products/9999/views", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
