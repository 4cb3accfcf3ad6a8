//! Durable coupon queue endpoints.

use std::sync::Arc;

use allocation::QueueSummary;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{UserId, WorkItemId};
use domain::WorkItem;

use crate::error::ApiError;
use crate::routes::coupons::IssueRequest;
use crate::state::AppState;

/// POST /coupons/queue — enqueue a coupon request regardless of strategy.
#[tracing::instrument(skip(state, req), fields(template = %req.template_name))]
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IssueRequest>,
) -> Result<(StatusCode, Json<WorkItem>), ApiError> {
    let item = state
        .queue
        .enqueue(UserId::new(req.user_id), &req.template_name)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(item)))
}

/// GET /coupons/queue/{id}
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<WorkItem>, ApiError> {
    Ok(Json(state.queue.status(WorkItemId::new(id)).await?))
}

/// POST /coupons/queue/{id}/retry
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<WorkItem>, ApiError> {
    Ok(Json(state.queue.retry(WorkItemId::new(id)).await?))
}

/// GET /coupons/queue/summary
pub async fn summary(State(state): State<Arc<AppState>>) -> Result<Json<QueueSummary>, ApiError> {
    Ok(Json(state.queue.summary().await?))
}
