use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::QuotaError;
use crate::models::token::TokenStatus;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct TokenQuotaResponse {
    pub token_id: i64,
    pub account_id: i64,
    pub remaining: i64,
    pub used: i64,
    pub unlimited: bool,
    pub status: TokenStatus,
    /// Usage recorded in memory but not yet persisted.
    pub pending_delta: i64,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub token_id: i64,
    pub account_id: i64,
    pub remaining: i64,
    pub unlimited: bool,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
pub struct AccountQuotaResponse {
    pub account_id: i64,
    pub remaining: i64,
    pub used: i64,
}

/// GET /api/v1/tokens/:id/quota
pub async fn get_token_quota(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<i64>,
) -> Result<Json<TokenQuotaResponse>, StatusCode> {
    let token = state
        .store
        .get_token(token_id)
        .await
        .map_err(|e| {
            tracing::error!(token_id, error = %e, "get_token_quota failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(TokenQuotaResponse {
        token_id: token.id,
        account_id: token.account_id,
        remaining: token.remaining_quota,
        used: token.used_quota,
        unlimited: token.unlimited_quota,
        status: token.status,
        pending_delta: state.metering.pending_delta(token.id),
    }))
}

/// POST /api/v1/tokens/validate
pub async fn validate_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, QuotaError> {
    let token = state.validator.validate_key(&req.key).await?;
    Ok(Json(ValidateResponse {
        token_id: token.id,
        account_id: token.account_id,
        remaining: token.remaining_quota,
        unlimited: token.unlimited_quota,
        expires_at: token.expires_at,
    }))
}

/// GET /api/v1/accounts/:id/quota
pub async fn get_account_quota(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Result<Json<AccountQuotaResponse>, StatusCode> {
    let quota = state
        .store
        .get_account_quota(account_id)
        .await
        .map_err(|e| {
            tracing::error!(account_id, error = %e, "get_account_quota failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(AccountQuotaResponse {
        account_id: quota.account_id,
        remaining: quota.remaining,
        used: quota.used,
    }))
}

/// GET /readyz
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /metrics
pub async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}
