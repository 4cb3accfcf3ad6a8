//! Product, stock and best-seller endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::{Money, ProductId};
use domain::{NewProduct, Product};
use ranking::RankedProduct;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateProductRequest {
    pub name: String,
    pub price: i64,
    #[serde(default)]
    pub stock: i64,
}

#[derive(Deserialize)]
pub struct QuantityRequest {
    pub quantity: i64,
}

#[derive(Deserialize)]
pub struct TopQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct MostViewedQuery {
    pub limit: Option<i64>,
}

const DEFAULT_TOP_LIMIT: usize = 10;

/// POST /products
#[tracing::instrument(skip(state, req), fields(name = %req.name))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let product = state
        .stock
        .create_product(NewProduct {
            name: req.name.trim().to_string(),
            price: Money::new(req.price),
            stock: req.stock,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// GET /products/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Product>, ApiError> {
    Ok(Json(state.stock.product(ProductId::new(id)).await?))
}

/// POST /products/{id}/stock/add
pub async fn add_stock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<QuantityRequest>,
) -> Result<Json<Product>, ApiError> {
    let product = state
        .stock
        .add_stock(ProductId::new(id), req.quantity)
        .await?;
    Ok(Json(product))
}

/// POST /products/{id}/stock/remove
pub async fn remove_stock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<QuantityRequest>,
) -> Result<Json<Product>, ApiError> {
    let product = state
        .stock
        .remove_stock(ProductId::new(id), req.quantity)
        .await?;
    Ok(Json(product))
}

/// GET /products/top?limit=N — best sellers of the last seven days.
pub async fn top(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<RankedProduct>>, ApiError> {
    let ranked = state
        .ranking
        .top(query.limit.unwrap_or(DEFAULT_TOP_LIMIT))
        .await?;
    Ok(Json(ranked))
}

/// POST /products/{id}/views
pub async fn record_view(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.stock.record_view(ProductId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /products/most-viewed?limit=N
pub async fn most_viewed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MostViewedQuery>,
) -> Result<Json<Vec<Product>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_TOP_LIMIT as i64);
    Ok(Json(state.stock.most_viewed(limit).await?))
}
