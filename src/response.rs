use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const CORS_ALLOWED_METHODS: &str = "GET, OPTIONS";
pub const CORS_ALLOWED_HEADERS: &str = "Content-Type, x-api-key";

/// Body of a 429 from the public API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceeded {
    pub error: String,
    pub message: String,
    pub reset_at: String,
}

impl RateLimitExceeded {
    pub fn new(reset_at: DateTime<Utc>) -> Self {
        Self {
            error: "Rate limit exceeded".to_string(),
            message: "Too many requests. Please try again later.".to_string(),
            reset_at: reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Whole seconds until `reset_at`, rounded up and never negative
pub fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

pub fn apply_rate_limit_headers(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    reset_at: DateTime<Utc>,
) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at.timestamp_millis()));
}

pub fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOWED_HEADERS),
    );
}

/// The 429 sent when a client has used up its window
pub fn rate_limited(limit: u32, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitExceeded::new(reset_at)),
    )
        .into_response();

    let headers = response.headers_mut();
    apply_rate_limit_headers(headers, limit, 0, reset_at);
    headers.insert(
        header::RETRY_AFTER,
        HeaderValue::from(retry_after_secs(reset_at, now)),
    );
    response
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreStatus,
}

#[derive(Debug, Serialize)]
pub struct StoreStatus {
    pub backend: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
