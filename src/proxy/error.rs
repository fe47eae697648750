use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

/// Internal error taxonomy. Handlers map these to the Anthropic wire shape
/// at the boundary; the messages carried here are already sanitized
/// (no emails, tokens, project ids or endpoint hosts). Unredacted detail
/// goes to the tracing log at the point of failure.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("upstream authentication failed")]
    Auth,

    #[error("upstream rejected the account (permission denied)")]
    Permission,

    /// All accounts rate limited beyond the wait threshold.
    #[error("all accounts are rate limited")]
    RateLimit { reset_at: chrono::DateTime<chrono::Utc> },

    #[error("upstream service unavailable")]
    ServiceUnavailable,

    #[error("upstream request timed out")]
    Timeout,

    #[error("no accounts available")]
    NoAccounts,

    #[error("request translation failed: {0}")]
    Translation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::Translation(_) => StatusCode::BAD_REQUEST,
            ProxyError::Auth => StatusCode::UNAUTHORIZED,
            ProxyError::Permission => StatusCode::FORBIDDEN,
            ProxyError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::ServiceUnavailable => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::NoAccounts => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic error type string for the wire payload.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::Translation(_) => "invalid_request_error",
            ProxyError::Auth => "authentication_error",
            ProxyError::Permission => "permission_error",
            ProxyError::RateLimit { .. } => "rate_limit_error",
            ProxyError::ServiceUnavailable | ProxyError::NoAccounts => "overloaded_error",
            ProxyError::Timeout => "timeout_error",
            ProxyError::Internal(_) => "api_error",
        }
    }

    /// Body for the Anthropic-compatible error envelope. Also used verbatim
    /// as the payload of a mid-stream `error` SSE event.
    pub fn to_error_body(&self) -> serde_json::Value {
        let mut error = json!({
            "type": self.error_type(),
            "message": self.to_string(),
        });

        if let ProxyError::RateLimit { reset_at } = self {
            error["reset_at"] = json!(reset_at.to_rfc3339());
        }

        json!({
            "type": "error",
            "error": error,
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(self.to_error_body())).into_response();

        if let ProxyError::RateLimit { reset_at } = &self {
            let wait = (*reset_at - chrono::Utc::now()).num_seconds().max(0);
            if let Ok(v) = axum::http::HeaderValue::from_str(&wait.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }

        response
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::InvalidRequest("bad".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::Auth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyError::Permission.status(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyError::NoAccounts.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::RateLimit { reset_at: chrono::Utc::now() }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_error_body_shape() {
        let body = ProxyError::InvalidRequest("messages must not be empty".into()).to_error_body();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "messages must not be empty");
    }

    #[test]
    fn test_rate_limit_body_carries_reset() {
        let reset_at = chrono::Utc::now() + chrono::Duration::seconds(300);
        let body = ProxyError::RateLimit { reset_at }.to_error_body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert!(body["error"]["reset_at"].as_str().is_some());
    }
}
