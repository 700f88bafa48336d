use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod handlers;

/// Build the full HTTP surface: health probes, metrics, and the status API
/// under `/api/v1`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(handlers::readiness_check))
        .route("/metrics", get(handlers::render_metrics))
        .nest("/api/v1", api_router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
}

/// Quota status and key validation routes, relative to `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/tokens/validate", post(handlers::validate_token))
        .route("/tokens/:id/quota", get(handlers::get_token_quota))
        .route("/accounts/:id/quota", get(handlers::get_account_quota))
        .layer(middleware::from_fn_with_state(state, admin_auth))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Validates the `x-admin-key` header when an admin key is configured.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(k) if k == expected => Ok(next.run(req).await),
        Some(k) => {
            // never log the full key
            let masked = if k.len() > 8 {
                format!("{}…{}", &k[..4], &k[k.len() - 4..])
            } else {
                "****".to_string()
            };
            tracing::warn!(provided = %masked, "status API: invalid admin key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("status API: missing x-admin-key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Stamps every response with a fresh `x-request-id`.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}
