use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("knowledge base not built")]
    IndexUnavailable,
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),
    #[error("provider timed out after {0}s")]
    ProviderTimeout(u64),
    #[error("provider returned a malformed payload: {0}")]
    ProviderBadResponse(String),
    #[error("tool failed: {0}")]
    Tool(String),
    #[error("cancelled by client")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }

    /// Short classification code carried by terminal `error` stream events.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::IndexUnavailable => "index_unavailable",
            ApiError::ProviderUnreachable(_) => "provider_unreachable",
            ApiError::ProviderAuth(_) => "provider_auth",
            ApiError::ProviderTimeout(_) => "provider_timeout",
            ApiError::ProviderBadResponse(_) => "provider_bad_response",
            ApiError::Tool(_) => "tool_error",
            ApiError::Cancelled => "cancelled",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::ProviderTimeout(_))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::IndexUnavailable => StatusCode::CONFLICT,
            ApiError::ProviderUnreachable(_)
            | ApiError::ProviderAuth(_)
            | ApiError::ProviderTimeout(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string(), "code": self.code() }));
        (status, body).into_response()
    }
}

/// Raised only during startup; maps to process exit code 1.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);
