//! Order settlement endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::UserId;
use domain::{Order, OrderNumber};
use saga::OrderRequest;

use crate::error::ApiError;
use crate::state::AppState;

/// POST /orders — settle an order.
#[tracing::instrument(skip(state, req), fields(user_id = %req.user_id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let order = state.saga.create_order(req).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders/{number}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order = state.saga.get_order(&OrderNumber::from(number)).await?;
    Ok(Json(order))
}

/// POST /orders/{number}/cancel
#[tracing::instrument(skip(state))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order = state.saga.cancel_order(&OrderNumber::from(number)).await?;
    Ok(Json(order))
}

/// GET /users/{user_id}/orders
pub async fn list_for_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = state.saga.orders_for_user(UserId::new(user_id)).await?;
    Ok(Json(orders))
}
