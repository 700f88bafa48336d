use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("token not found")]
    NotFound,

    #[error("account not found")]
    AccountNotFound,

    #[error("no token key provided")]
    MissingKey,

    #[error("invalid quota amount: {0}")]
    InvalidAmount(i64),

    #[error("token disabled")]
    Disabled,

    #[error("token expired")]
    Expired,

    #[error("token quota exhausted")]
    Exhausted,

    #[error("insufficient token quota")]
    InsufficientTokenQuota,

    #[error("insufficient account quota")]
    InsufficientAccountQuota,

    #[error("usage intake queue is full")]
    Backpressure,

    #[error("usage intake is closed")]
    IntakeClosed,

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl QuotaError {
    /// Stable machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::NotFound => "token_not_found",
            QuotaError::AccountNotFound => "account_not_found",
            QuotaError::MissingKey => "missing_key",
            QuotaError::InvalidAmount(_) => "invalid_amount",
            QuotaError::Disabled => "token_disabled",
            QuotaError::Expired => "token_expired",
            QuotaError::Exhausted => "token_exhausted",
            QuotaError::InsufficientTokenQuota => "insufficient_token_quota",
            QuotaError::InsufficientAccountQuota => "insufficient_account_quota",
            QuotaError::Backpressure => "backpressure",
            QuotaError::IntakeClosed => "intake_closed",
            QuotaError::Store(_) => "store_error",
        }
    }
}

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_type, msg) = match &self {
            QuotaError::NotFound | QuotaError::MissingKey => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid or missing token".to_string(),
            ),
            QuotaError::AccountNotFound => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                self.to_string(),
            ),
            QuotaError::InvalidAmount(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                self.to_string(),
            ),
            QuotaError::Disabled | QuotaError::Expired => (
                StatusCode::FORBIDDEN,
                "permission_error",
                self.to_string(),
            ),
            QuotaError::Exhausted
            | QuotaError::InsufficientTokenQuota
            | QuotaError::InsufficientAccountQuota => (
                StatusCode::PAYMENT_REQUIRED,
                "billing_error",
                self.to_string(),
            ),
            QuotaError::Backpressure | QuotaError::IntakeClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                self.to_string(),
            ),
            QuotaError::Store(e) => {
                tracing::error!("Store error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if matches!(self, QuotaError::Backpressure) {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("1"),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_errors_map_to_payment_required() {
        for err in [
            QuotaError::Exhausted,
            QuotaError::InsufficientTokenQuota,
            QuotaError::InsufficientAccountQuota,
        ] {
            assert_eq!(err.into_response().status(), StatusCode::PAYMENT_REQUIRED);
        }
    }

    #[test]
    fn test_backpressure_sets_retry_after() {
        let resp = QuotaError::Backpressure.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()["retry-after"], "1");
    }

    #[test]
    fn test_store_error_is_opaque() {
        let err = QuotaError::from(anyhow::anyhow!("connection refused"));
        assert_eq!(err.code(), "store_error");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_invalid_amount_is_bad_request() {
        let resp = QuotaError::InvalidAmount(-1).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
