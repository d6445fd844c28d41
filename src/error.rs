use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Unified application error type following the Anthropic error format.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("You have exhausted your capacity on {model}. Quota will reset after {reset}.")]
    QuotaExhausted { model: String, reset: String },

    #[error("RESOURCE_EXHAUSTED: all accounts are rate limited for {model}; earliest reset in {reset}")]
    AllRateLimited { model: String, reset: String },

    #[error("No accounts are configured")]
    NoAccounts,

    #[error("Model {model} is over capacity, please retry later")]
    Overloaded { model: String },

    #[error("Max retries exceeded for {model}: {detail}")]
    MaxRetriesExceeded { model: String, detail: String },

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Anthropic-compatible error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    r#type: &'static str,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    r#type: String,
    message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::QuotaExhausted { .. } | Self::AllRateLimited { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::NoAccounts | Self::Overloaded { .. } | Self::MaxRetriesExceeded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic error type string for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "authentication_error",
            Self::BadRequest(_) | Self::QuotaExhausted { .. } | Self::AllRateLimited { .. } => {
                "invalid_request_error"
            }
            Self::NoAccounts
            | Self::Overloaded { .. }
            | Self::MaxRetriesExceeded { .. }
            | Self::Upstream { .. } => "api_error",
            Self::Internal(_) => "api_error",
        }
    }

    /// Serialize this error into the Anthropic error JSON shape.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            r#type: "error",
            error: ErrorDetail {
                r#type: self.error_type().to_string(),
                message: self.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_maps_to_401() {
        let err = AppError::Unauthorized("missing key".into());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.error_type(), "authentication_error");
    }

    #[test]
    fn test_quota_exhausted_is_invalid_request() {
        let err = AppError::QuotaExhausted {
            model: "claude-sonnet-4-5".into(),
            reset: "5m".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "invalid_request_error");
        assert!(err.to_string().contains("claude-sonnet-4-5"));
    }

    #[test]
    fn test_all_rate_limited_message() {
        let err = AppError::AllRateLimited {
            model: "m".into(),
            reset: "90s".into(),
        };
        assert!(err.to_string().starts_with("RESOURCE_EXHAUSTED"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upstream_passthrough_status() {
        let err = AppError::Upstream {
            status: 507,
            message: "odd".into(),
        };
        assert_eq!(err.status_code().as_u16(), 507);
        assert_eq!(err.error_type(), "api_error");
    }

    #[test]
    fn test_body_shape() {
        let err = AppError::NoAccounts;
        let body = err.to_body();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "api_error");
        assert!(body["error"]["message"].is_string());
    }
}
