use crate::rate_limit_config::Policy;
use crate::store::RateLimitResult;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// JSON body of a denial response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub error: String,
    pub retry_after: u64,
}

/// Formats denial responses and quota headers.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Terminal response for a request that exceeded `policy`.
    pub fn denial(policy: &Policy, result: &RateLimitResult, now_ms: u64) -> Response {
        let retry_after = retry_after_secs(result.reset_time_ms, now_ms);
        let status =
            StatusCode::from_u16(policy.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);

        let body = DenialBody {
            error: policy.message.clone(),
            retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        set_quota_headers(headers, policy.max_requests, 0, result.reset_time_ms);
        response
    }

    /// Add the `X-RateLimit-*` headers of an admitted request to the
    /// downstream response. Status and body are left untouched.
    pub fn annotate(mut response: Response, result: &RateLimitResult) -> Response {
        set_quota_headers(
            response.headers_mut(),
            result.limit,
            result.remaining,
            result.reset_time_ms,
        );
        response
    }
}

fn set_quota_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, reset_time_ms: u64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_time_ms.div_ceil(1000)));
}

/// Whole seconds until the window resets, rounded up.
pub fn retry_after_secs(reset_time_ms: u64, now_ms: u64) -> u64 {
    reset_time_ms.saturating_sub(now_ms).div_ceil(1000)
}
