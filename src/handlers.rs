use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::health::HealthChecker;
use crate::key_generator::KeyGenerator;
use crate::metrics::{MetricsCollector, ThrottleMetrics};
use crate::rate_limiter::RateLimiter;

/// Application state shared by handlers and the rate limit middleware
#[derive(Clone)]
pub struct AppState {
    pub rate_limiter: RateLimiter,
    pub key_generator: KeyGenerator,
    pub metrics: MetricsCollector,
    pub health: HealthChecker,
    pub path_prefix: Arc<str>,
}

impl AppState {
    pub fn new(rate_limiter: RateLimiter, key_generator: KeyGenerator, path_prefix: &str) -> Self {
        Self {
            health: HealthChecker::new(rate_limiter.clone()),
            rate_limiter,
            key_generator,
            metrics: MetricsCollector::new(),
            path_prefix: Arc::from(path_prefix),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub max_requests: u32,
    pub window_ms: u64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct EndpointInfo {
    pub path: &'static str,
    pub method: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TermsOfUse {
    pub educational: bool,
    pub commercial: bool,
    pub attribution: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiInfoResponse {
    pub success: bool,
    pub message: String,
    pub version: String,
    pub documentation: String,
    pub endpoints: Vec<EndpointInfo>,
    pub rate_limit: RateLimitInfo,
    pub terms_of_use: TermsOfUse,
}

fn public_endpoints() -> Vec<EndpointInfo> {
    vec![
        EndpointInfo {
            path: "/api/public/vehicles",
            method: "GET",
            description: "Get all vehicles with optional filters",
        },
        EndpointInfo {
            path: "/api/public/vehicles/:id",
            method: "GET",
            description: "Get a specific vehicle by ID",
        },
        EndpointInfo {
            path: "/api/public/stats",
            method: "GET",
            description: "Get inventory statistics",
        },
    ]
}

#[derive(Debug, Serialize)]
pub struct NotFoundResponse {
    pub success: bool,
    pub error: String,
    pub path: String,
}

/// Describe the public API and its rate limit policy
pub async fn api_info(State(state): State<AppState>) -> Json<ApiInfoResponse> {
    let policy = state.rate_limiter.policy();
    let window_ms = policy.window.as_millis() as u64;

    let message = if window_ms == 60_000 {
        format!("{} requests per minute", policy.max_requests)
    } else {
        format!("{} requests per {} ms", policy.max_requests, window_ms)
    };

    Json(ApiInfoResponse {
        success: true,
        message: "Public inventory API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        documentation: "/api-docs".to_string(),
        endpoints: public_endpoints(),
        rate_limit: RateLimitInfo {
            max_requests: policy.max_requests,
            window_ms,
            message,
        },
        terms_of_use: TermsOfUse {
            educational: true,
            commercial: false,
            attribution: "Required",
        },
    })
}

/// Catch-all for public API paths no handler serves
pub async fn public_not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            success: false,
            error: "Endpoint not found".to_string(),
            path: uri.path().to_string(),
        }),
    )
}

/// CORS preflight for the public API; the middleware adds the headers
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.health.check_store().await;

    if store.error.is_none() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": store.backend,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": store.backend,
                "error": store.error,
            })),
        )
    }
}

pub async fn metrics(State(state): State<AppState>) -> Json<ThrottleMetrics> {
    Json(state.metrics.snapshot())
}
