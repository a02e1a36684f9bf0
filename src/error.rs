use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::keys::RateLimitStatus;

/* ============================= ERROR KINDS ============================= */

/// Errors the HTTP boundary translates into status codes. The execution
/// core never raises these; it always returns a shaped result.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API key required")]
    AuthMissing,

    #[error("Invalid or missing API key")]
    AuthInvalid,

    #[error("Too many authentication failures. Please try again later.")]
    IpThrottled { retry_after_s: u64 },

    #[error("Rate limit exceeded")]
    RateLimited { status: RateLimitStatus },

    #[error("{0}")]
    Validation(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("Internal server error")]
    Internal { detail: String, debug: bool },
}

impl ApiError {
    /// Wrap an unexpected failure; `debug` decides whether the detail is
    /// sent to the client or only logged.
    pub fn internal(detail: impl std::fmt::Display, debug: bool) -> Self {
        ApiError::Internal { detail: detail.to_string(), debug }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthMissing | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::IpThrottled { .. } | ApiError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Detail is always logged; it reaches the client only in
            // debug mode
            ApiError::Internal { detail, debug } => {
                error!(detail = %detail, "internal_error");
                if *debug {
                    detail.clone()
                } else {
                    self.to_string()
                }
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": message,
            "timestamp": Utc::now().to_rfc3339(),
        }));

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();

        match &self {
            ApiError::IpThrottled { retry_after_s } => {
                headers.insert(
                    header::RETRY_AFTER,
                    header_value(&retry_after_s.to_string()),
                );
            }
            ApiError::RateLimited { status } => {
                let retry_after = (status.resets_at - Utc::now()).num_seconds().max(0);
                headers.insert(header::RETRY_AFTER, header_value(&retry_after.to_string()));
                if let Some(limit) = status.limit {
                    headers.insert("x-ratelimit-limit", header_value(&limit.to_string()));
                }
                headers.insert(
                    "x-ratelimit-remaining",
                    header_value(&status.remaining.unwrap_or(0).to_string()),
                );
                headers.insert("x-ratelimit-period", header_value(status.period.as_str()));
                headers.insert(
                    "x-ratelimit-reset",
                    header_value(&status.resets_at.to_rfc3339()),
                );
            }
            _ => {}
        }

        response
    }
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

/* ============================= TESTS ============================= */
