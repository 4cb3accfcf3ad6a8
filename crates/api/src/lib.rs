//! HTTP API for coupon allocation and order settlement.
//!
//! Exposes the coupon strategies, the durable queue, wallets, products,
//! the settlement saga and the best-seller ranking over REST, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError};
pub use error::ApiError;
pub use state::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        // coupons
        .route("/coupons/templates", post(routes::coupons::create_template))
        .route("/coupons/templates/{name}", get(routes::coupons::get_template))
        .route("/coupons/issue", post(routes::coupons::issue))
        .route(
            "/coupons/waiting/{template_name}/users/{user_id}",
            get(routes::coupons::waiting_position),
        )
        .route("/coupons/queue", post(routes::queue::enqueue))
        .route("/coupons/queue/summary", get(routes::queue::summary))
        .route("/coupons/queue/{id}", get(routes::queue::status))
        .route("/coupons/queue/{id}/retry", post(routes::queue::retry))
        // accounts
        .route("/accounts", post(routes::wallets::open))
        .route("/users/{user_id}/coupons", get(routes::coupons::user_issuances))
        .route("/users/{user_id}/orders", get(routes::orders::list_for_user))
        .route("/wallets/{user_id}", get(routes::wallets::get))
        .route("/wallets/{user_id}/charge", post(routes::wallets::charge))
        .route("/wallets/{user_id}/withdraw", post(routes::wallets::withdraw))
        // catalog
        .route("/products", post(routes::products::create))
        .route("/products/top", get(routes::products::top))
        .route("/products/most-viewed", get(routes::products::most_viewed))
        .route("/products/{id}", get(routes::products::get))
        .route("/products/{id}/stock/add", post(routes::products::add_stock))
        .route("/products/{id}/stock/remove", post(routes::products::remove_stock))
        .route("/products/{id}/views", post(routes::products::record_view))
        // orders
        .route("/orders", post(routes::orders::create))
        .route("/orders/{number}", get(routes::orders::get))
        .route("/orders/{number}/cancel", post(routes::orders::cancel))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
