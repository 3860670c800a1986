//! Gateway error types.
//!
//! Every request-path failure is classified into one of these variants and
//! rendered as an OpenAI-shaped error body:
//! `{"error": {"message": ..., "type": ..., "code": <status>}}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

/// Errors surfaced to clients by the request pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Bad body, unknown model, missing field.
    #[error("{0}")]
    InvalidRequest(String),
    /// Missing, invalid, disabled or expired API key.
    #[error("{0}")]
    Unauthorized(String),
    /// Monthly budget exhausted.
    #[error("{0}")]
    BudgetExceeded(String),
    /// Valid key, but the resolved model is not on its allow-list.
    #[error("{0}")]
    Forbidden(String),
    /// Fixed-window rate limit exhausted. Carries the limiter decision so the
    /// response can include the standard hint headers.
    #[error("{message}")]
    RateLimited {
        message: String,
        limit: i64,
        remaining: i64,
        retry_after_secs: i64,
        reset_at: i64,
    },
    /// Upstream provider failure (network error or non-2xx).
    #[error("{0}")]
    Upstream(String),
    /// Dependency or programming error on the hot path.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::BudgetExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        if self.status().is_server_error() {
            "api_error"
        } else {
            "invalid_request_error"
        }
    }

    /// The JSON body without the surrounding response.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.status().as_u16(),
            }
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(
            status = status.as_u16(),
            error = %self,
            "returning error response"
        );

        let mut response = (status, Json(self.body())).into_response();

        if let GatewayError::RateLimited {
            limit,
            remaining,
            retry_after_secs,
            reset_at,
            ..
        } = &self
        {
            let headers = response.headers_mut();
            insert_int_header(headers, "x-ratelimit-limit", *limit);
            insert_int_header(headers, "x-ratelimit-remaining", *remaining);
            insert_int_header(headers, "x-ratelimit-reset", *reset_at);
            insert_int_header(headers, header::RETRY_AFTER.as_str(), *retry_after_secs);
        }

        response
    }
}

fn insert_int_header(headers: &mut axum::http::HeaderMap, name: &str, value: i64) {
    if let (Ok(name), Ok(value)) = (
        name.parse::<axum::http::HeaderName>(),
        HeaderValue::from_str(&value.to_string()),
    ) {
        headers.insert(name, value);
    }
}
