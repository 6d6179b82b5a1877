use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use std::net::SocketAddr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::handlers::AppState;
use crate::key_generator::KeyGenerator;
use crate::rate_limiter::{Decision, Fallback};
use crate::response::{apply_cors_headers, apply_rate_limit_headers, rate_limited};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Logging middleware for request/response tracking.
///
/// Tags every request with an `x-request-id`, reusing the caller's when
/// it sent one.
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let request_id_value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &request_id_value {
        request.headers_mut().insert(X_REQUEST_ID, value.clone());
    }

    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = KeyGenerator::extract_forwarded_address(request.headers())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        target: "showroom_throttler::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    if let Some(value) = request_id_value {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }

    info!(
        target: "showroom_throttler::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}

/// Admission control for the public API.
///
/// Paths outside the configured prefix pass straight through without
/// touching any quota. Inside it, admitted requests get rate limit and
/// CORS headers on the handler's response; the rest get a 429.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with(state.path_prefix.as_ref()) {
        state.metrics.record_bypass();
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = state.key_generator.identify(request.headers(), peer);
    let key = identity.key();

    let now = Utc::now();
    let evaluation = state.rate_limiter.assess_at(&key, now).await;
    if evaluation.fallback == Some(Fallback::StoreUnavailable) {
        state.metrics.record_store_failure();
    }
    let decision = evaluation.decision;
    state.metrics.record_decision(&decision);
    let limit = state.rate_limiter.policy().max_requests;

    match decision {
        Decision::Denied { window_reset_at } => {
            info!(
                target: "showroom_throttler::middleware",
                client = %key,
                source = identity.kind(),
                reset_at = %window_reset_at,
                "Rate limit exceeded"
            );
            rate_limited(limit, window_reset_at, now)
        }
        Decision::Allowed {
            remaining,
            window_reset_at,
        } => {
            debug!(
                target: "showroom_throttler::middleware",
                client = %key,
                remaining,
                "Request admitted"
            );
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            apply_rate_limit_headers(headers, limit, remaining, window_reset_at);
            apply_cors_headers(headers);
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(logging_middleware))
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let response = app()
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }
}
