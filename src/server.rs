use crate::config::Config;
use crate::error::Result;
use crate::handlers::{
    api_info, health_check, metrics, preflight, public_not_found, readiness_check, AppState,
};
use crate::key_generator::KeyGenerator;
use crate::middleware::{logging_middleware, rate_limit_middleware};
use crate::quota_store::{MemoryQuotaStore, QuotaStore};
use crate::rate_limiter::RateLimiter;
use crate::redis::RedisQuotaStore;
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let store = build_store(&config).await?;
        let state = build_state(&config, store);
        Ok(Self { config, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> Result<()> {
        let app = create_app(self.state.clone(), public_api());
        let sweeper = spawn_sweeper(self.state.clone(), self.config.cleanup_interval());

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        info!(
            bind_addr = %self.config.bind_addr,
            path_prefix = %self.config.path_prefix,
            max_requests = self.config.max_requests,
            window_ms = self.config.window_ms,
            store = self.state.rate_limiter.store().backend(),
            "Throttler server listening"
        );
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        sweeper.abort();
        Ok(())
    }
}

/// Redis when a URL is configured, process memory otherwise
pub async fn build_store(config: &Config) -> Result<Arc<dyn QuotaStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisQuotaStore::connect(url).await?;
            info!("Using Redis quota store");
            Ok(Arc::new(store))
        }
        None => {
            info!(
                capacity = config.max_tracked_clients,
                "Using in-memory quota store"
            );
            Ok(Arc::new(MemoryQuotaStore::new(config.max_tracked_clients)))
        }
    }
}

pub fn build_state(config: &Config, store: Arc<dyn QuotaStore>) -> AppState {
    let rate_limiter = RateLimiter::new(config.policy(), store);
    let key_generator = KeyGenerator::new(config.peer_address_fallback);
    AppState::new(rate_limiter, key_generator, &config.path_prefix)
}

/// Routes of the public API served by this process.
///
/// Inventory handlers live elsewhere; here `/api/public` describes the
/// API and everything beneath it answers preflights or 404s.
pub fn public_api() -> Router<AppState> {
    Router::new()
        .route("/api/public", get(api_info))
        .route(
            "/api/public/*path",
            get(public_not_found).options(preflight),
        )
}

/// Assemble the application around `public_api`, which sits behind the
/// rate limiter like every other route.
pub fn create_app(state: AppState, public_api: Router<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .merge(public_api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit_middleware,
                )),
        )
        .with_state(state)
}

fn spawn_sweeper(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            match state.rate_limiter.sweep().await {
                Ok(removed) => {
                    state.metrics.record_sweep(removed);
                    debug!(removed, "Swept expired quota records");
                }
                Err(err) => warn!(error = %err, "Quota sweep failed"),
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
