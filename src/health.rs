use std::time::Instant;

use chrono::Utc;

use crate::rate_limiter::RateLimiter;
use crate::response::{HealthResponse, StoreStatus};

#[derive(Clone)]
pub struct HealthChecker {
    rate_limiter: RateLimiter,
    started_at: Instant,
}

impl HealthChecker {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            rate_limiter,
            started_at: Instant::now(),
        }
    }

    pub async fn check_health(&self) -> HealthResponse {
        let store = self.check_store().await;

        // The limiter fails open, so a broken store degrades rather than fails.
        let status = if store.error.is_none() {
            "healthy"
        } else {
            "degraded"
        };

        HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now().timestamp(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            store,
        }
    }

    pub async fn check_store(&self) -> StoreStatus {
        let store = self.rate_limiter.store();
        match store.ping().await {
            Ok(()) => StoreStatus {
                backend: store.backend().to_string(),
                status: "healthy".to_string(),
                error: None,
            },
            Err(err) => StoreStatus {
                backend: store.backend().to_string(),
                status: "unavailable".to_string(),
                error: Some(err.to_string()),
            },
        }
    }
}
