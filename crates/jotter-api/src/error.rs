//! HTTP error mapping.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jotter_core::RateLimitDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Rate limit headers for an admission-checked response.
pub fn rate_limit_headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
    headers
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(jotter_core::Error),
}

impl From<jotter_core::Error> for ApiError {
    fn from(err: jotter_core::Error) -> Self {
        use jotter_core::Error;

        match err {
            Error::RateLimited(decision) => ApiError::RateLimited(decision),
            Error::CounterStoreUnavailable(msg) => ApiError::Unavailable(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::RequestNotFound(id) => ApiError::NotFound(format!("request {id} not found")),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            Error::Forbidden(msg) => ApiError::Forbidden(msg),
            err @ Error::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::RateLimited(decision) => return rate_limited_response(&decision),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let mut headers = rate_limit_headers(decision);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));

    let body = Json(serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": format!(
            "Too many requests. Please wait {} seconds before retrying.",
            decision.retry_after_secs
        ),
        "retryAfter": decision.retry_after_secs,
    }));

    (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jotter_core::{Error, RequestStatus};
    use uuid::Uuid;

    fn denied() -> RateLimitDecision {
        RateLimitDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: 1_700_000_060,
            retry_after_secs: 42,
        }
    }

    #[test]
    fn test_rate_limited_response_has_headers() {
        let response = ApiError::from(Error::RateLimited(denied())).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000060");
        assert_eq!(headers[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                Error::CounterStoreUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::RequestNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (Error::InvalidInput("empty".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized("no".into()), StatusCode::UNAUTHORIZED),
            (Error::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (
                Error::InvalidTransition {
                    from: RequestStatus::Completed,
                    to: RequestStatus::Cancelled,
                },
                StatusCode::CONFLICT,
            ),
            (Error::Job("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
