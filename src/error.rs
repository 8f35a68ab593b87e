//! Application Error Taxonomy
//! Mission: one error type the whole request path converges to, covering
//! authentication, validation, rate limiting and quota failures alike.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    Unauthorized(&'static str),
    InvalidRequest(String),
    RateLimited { retry_after_seconds: u64 },
    NoResults,
    QuotaExceeded { free_exhausted: bool, balance: i64 },
    ApiError(anyhow::Error),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            AppError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            AppError::RateLimited { retry_after_seconds } => {
                write!(f, "rate limited, retry after {retry_after_seconds}s")
            }
            AppError::NoResults => write!(f, "no comparable results found"),
            AppError::QuotaExceeded { .. } => write!(f, "credit quota exceeded"),
            AppError::ApiError(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "UNAUTHORIZED",
                    message: msg.to_string(),
                }),
            )
                .into_response(),
            AppError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "INVALID_REQUEST",
                    message: msg,
                }),
            )
                .into_response(),
            AppError::RateLimited { retry_after_seconds } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_seconds.to_string())],
                Json(json!({
                    "error": "RATE_LIMITED",
                    "message": "Too many requests",
                    "retryAfterSeconds": retry_after_seconds,
                })),
            )
                .into_response(),
            AppError::NoResults => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "NO_RESULTS",
                    message: "No comparable listings were found for this item".to_string(),
                }),
            )
                .into_response(),
            AppError::QuotaExceeded { free_exhausted, balance } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "error": if free_exhausted { "FREE_EXHAUSTED" } else { "QUOTA_EXCEEDED" },
                    "message": "No credits available for this comparison",
                    "balance": balance,
                })),
            )
                .into_response(),
            AppError::ApiError(err) => {
                tracing::error!(error = %err, "internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "API_ERROR",
                        message: "Internal server error".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = AppError::RateLimited { retry_after_seconds: 17 };
        assert!(err.to_string().contains("17"));
    }
}
