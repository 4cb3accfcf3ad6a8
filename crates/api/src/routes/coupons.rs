//! Coupon template and issuance endpoints.

use std::sync::Arc;

use allocation::{Allocation, TemplateRef};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{Money, UserId};
use domain::{CouponTemplate, Issuance, NewCouponTemplate};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub total_count: i64,
    pub discount_amount: i64,
    #[serde(default)]
    pub min_order_amount: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct IssueRequest {
    pub user_id: i64,
    pub template_name: String,
}

#[derive(Serialize)]
pub struct WaitingPositionResponse {
    pub template_name: String,
    pub user_id: UserId,
    /// Zero-based rank, absent once the user is no longer waiting.
    pub position: Option<u64>,
    pub size: u64,
}

/// POST /coupons/templates — define a coupon template.
#[tracing::instrument(skip(state, req), fields(name = %req.name))]
pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<CouponTemplate>), ApiError> {
    let template = state
        .catalog
        .create_template(NewCouponTemplate {
            name: req.name.trim().to_string(),
            total_count: req.total_count,
            discount_amount: Money::new(req.discount_amount),
            min_order_amount: Money::new(req.min_order_amount),
            expires_at: req.expires_at,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(template)))
}

/// GET /coupons/templates/{name}
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<CouponTemplate>, ApiError> {
    let template = state.catalog.template(&TemplateRef::from(name)).await?;
    Ok(Json(template))
}

/// POST /coupons/issue — request a coupon through the configured strategy.
///
/// Synchronous strategies answer 201 with the issuance. Deferred ones
/// answer 202 with the queued request or the waiting-list position.
#[tracing::instrument(skip(state, req), fields(strategy = %state.allocator.strategy()))]
pub async fn issue(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IssueRequest>,
) -> Result<(StatusCode, Json<Allocation>), ApiError> {
    let allocation = state
        .allocator
        .request(UserId::new(req.user_id), TemplateRef::from(req.template_name))
        .await?;
    let (status, outcome) = match allocation {
        Allocation::Issued(_) => (StatusCode::CREATED, "issued"),
        Allocation::Enqueued(_) => (StatusCode::ACCEPTED, "enqueued"),
        Allocation::Waiting { .. } => (StatusCode::ACCEPTED, "waiting"),
    };
    metrics::counter!("api_coupon_requests_total", "outcome" => outcome).increment(1);
    Ok((status, Json(allocation)))
}

/// GET /coupons/waiting/{template_name}/users/{user_id}
pub async fn waiting_position(
    State(state): State<Arc<AppState>>,
    Path((template_name, user_id)): Path<(String, i64)>,
) -> Result<Json<WaitingPositionResponse>, ApiError> {
    let user_id = UserId::new(user_id);
    let position = state.waiting.position(user_id, &template_name).await?;
    let size = state.waiting.size(&template_name).await?;
    Ok(Json(WaitingPositionResponse {
        template_name,
        user_id,
        position,
        size,
    }))
}

/// GET /users/{user_id}/coupons
pub async fn user_issuances(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<Issuance>>, ApiError> {
    let issuances = state
        .catalog
        .list_user_issuances(UserId::new(user_id))
        .await?;
    Ok(Json(issuances))
}
