//! Account and wallet endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{Money, UserId};
use domain::{User, WalletAccount};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct OpenAccountRequest {
    pub name: String,
    #[serde(default)]
    pub initial_balance: i64,
}

#[derive(Serialize)]
pub struct AccountResponse {
    pub user: User,
    pub wallet: WalletAccount,
}

#[derive(Deserialize)]
pub struct AmountRequest {
    pub amount: i64,
}

/// POST /accounts — register a user with a wallet.
#[tracing::instrument(skip(state, req))]
pub async fn open(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    let (user, wallet) = state
        .wallet
        .open_account(&req.name, Money::new(req.initial_balance))
        .await?;
    Ok((StatusCode::CREATED, Json(AccountResponse { user, wallet })))
}

/// GET /wallets/{user_id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<WalletAccount>, ApiError> {
    Ok(Json(state.wallet.wallet(UserId::new(user_id)).await?))
}

/// POST /wallets/{user_id}/charge
pub async fn charge(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<WalletAccount>, ApiError> {
    let wallet = state
        .wallet
        .charge(UserId::new(user_id), Money::new(req.amount))
        .await?;
    Ok(Json(wallet))
}

/// POST /wallets/{user_id}/withdraw
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<WalletAccount>, ApiError> {
    let wallet = state
        .wallet
        .withdraw(UserId::new(user_id), Money::new(req.amount))
        .await?;
    Ok(Json(wallet))
}
