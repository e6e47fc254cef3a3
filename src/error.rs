use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Out of stock")]
    OutOfStock,

    #[error("Discount rejected: {0}")]
    DiscountRejected(String),

    #[error("User is banned")]
    Banned,

    #[error("Service unavailable")]
    Unavailable,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Transient errors are safe to retry with backoff for idempotent work.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db_err)) => {
                // 40001 serialization_failure, 40P01 deadlock_detected,
                // 55P03 lock_not_available
                matches!(
                    db_err.code().as_deref(),
                    Some("40001") | Some("40P01") | Some("55P03")
                )
            }
            AppError::Database(sqlx::Error::PoolTimedOut) => true,
            AppError::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Database(ref e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                e.to_string(),
            ),
            AppError::Gateway(ref msg) => {
                (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR", msg.clone())
            }
            AppError::Telegram(ref msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "TELEGRAM_ERROR",
                msg.clone(),
            ),
            AppError::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                "INVALID_SIGNATURE",
                "Signature verification failed".to_string(),
            ),
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "Request body exceeds limit".to_string(),
            ),
            AppError::OutOfStock => (
                StatusCode::CONFLICT,
                "OUT_OF_STOCK",
                "The selected item is no longer available".to_string(),
            ),
            AppError::DiscountRejected(ref msg) => {
                (StatusCode::BAD_REQUEST, "DISCOUNT_REJECTED", msg.clone())
            }
            AppError::Banned => (
                StatusCode::FORBIDDEN,
                "USER_BANNED",
                "This account is restricted".to_string(),
            ),
            AppError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Service is starting up, try again shortly".to_string(),
            ),
            AppError::NotFound(ref msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
            }
            AppError::Unauthorized(ref msg) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
            }
            AppError::Internal(ref msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        assert!(AppError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn business_rejects_are_not_transient() {
        assert!(!AppError::OutOfStock.is_transient());
        assert!(!AppError::DiscountRejected("limit".into()).is_transient());
        assert!(!AppError::InvalidSignature.is_transient());
    }
}
