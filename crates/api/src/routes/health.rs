//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub coupon_strategy: &'static str,
    pub stock_reservation: &'static str,
}

/// GET /health — returns liveness and the active strategies.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        coupon_strategy: state.config.coupon_strategy.as_str(),
        stock_reservation: state.config.stock_reservation.as_str(),
    })
}
