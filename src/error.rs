//! Error types for the proxy.
//!
//! Centralized error handling using thiserror, mirroring the error taxonomy
//! of the admission and upstream-calling subsystems so every failure mode
//! maps onto a single HTTP status and a stable JSON envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// All error types that can occur while proxying a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request body failed validation (empty messages, unknown model, bad JSON).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Tenant has exhausted its daily token budget.
    #[error("daily quota exceeded: used {used_today} of {daily_limit}")]
    QuotaExceededToday { used_today: u64, daily_limit: u64 },

    /// Admission could not reserve capacity before the request's deadline.
    #[error("admission deadline exceeded waiting for capacity")]
    AdmissionDeadlineExceeded,

    /// Upstream returned a non-retryable 4xx; forwarded verbatim to the caller.
    #[error("upstream rejected the request: {status}")]
    UpstreamRejected { status: u16, body: serde_json::Value },

    /// Upstream kept returning 429 after retries were exhausted.
    #[error("upstream rate limit persisted after retries: {0}")]
    UpstreamRateLimitExhausted(String),

    /// Upstream stayed unavailable (5xx/network) after retries were exhausted.
    #[error("upstream unavailable after retries: {0}")]
    UpstreamExhausted(String),

    /// Estimator, accountant, or other internal invariant violation.
    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// The error `type` tag used in the JSON envelope.
    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::QuotaExceededToday { .. } | ProxyError::AdmissionDeadlineExceeded => {
                "rate_limit_error"
            }
            ProxyError::UpstreamRejected { .. } => "upstream_error",
            ProxyError::UpstreamRateLimitExhausted(_) => "rate_limit_error",
            ProxyError::UpstreamExhausted(_) => "api_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::QuotaExceededToday { .. } | ProxyError::AdmissionDeadlineExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::UpstreamRateLimitExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::UpstreamExhausted(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // UpstreamRejected forwards the provider's body verbatim rather than
        // wrapping it; everything else gets the stable envelope.
        let body = match &self {
            ProxyError::UpstreamRejected { body, .. } => body.clone(),
            ProxyError::QuotaExceededToday { used_today, daily_limit } => json!({
                "type": "error",
                "error": {
                    "type": self.error_type(),
                    "message": self.to_string(),
                    "used_today": used_today,
                    "daily_limit": daily_limit,
                }
            }),
            _ => json!({
                "type": "error",
                "error": {
                    "type": self.error_type(),
                    "message": self.to_string(),
                }
            }),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_message() {
        let err = ProxyError::InvalidRequest("messages must not be empty".to_string());
        assert_eq!(err.to_string(), "invalid request: messages must not be empty");
    }

    #[test]
    fn test_quota_exceeded_message() {
        let err = ProxyError::QuotaExceededToday { used_today: 499_000, daily_limit: 500_000 };
        assert!(err.to_string().contains("499000"));
    }

    #[test]
    fn test_error_type_mapping() {
        assert_eq!(ProxyError::AdmissionDeadlineExceeded.error_type(), "rate_limit_error");
        assert_eq!(ProxyError::Internal("boom".into()).error_type(), "internal_error");
        assert_eq!(ProxyError::UpstreamExhausted("boom".into()).error_type(), "api_error");
        assert_eq!(
            ProxyError::UpstreamRateLimitExhausted("boom".into()).error_type(),
            "rate_limit_error"
        );
    }
}
