use crate::error::Result;
use crate::rate_limiter::RateLimitPolicy;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use validator::{Validate, ValidationError};

pub const DEFAULT_MAX_REQUESTS: u32 = 30;
pub const DEFAULT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_PATH_PREFIX: &str = "/api/public/";

#[derive(Debug, Clone, Parser, Validate)]
#[command(name = "showroom-throttler", version, about = "Rate limiter for the public inventory API")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; quotas stay in process memory when unset
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Requests admitted per client per window
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = DEFAULT_MAX_REQUESTS)]
    #[validate(range(min = 1))]
    pub max_requests: u32,

    /// Window length in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = DEFAULT_WINDOW_MS)]
    #[validate(range(min = 1))]
    pub window_ms: u64,

    /// Only requests under this path are rate limited
    #[arg(long, env = "RATE_LIMIT_PATH_PREFIX", default_value = DEFAULT_PATH_PREFIX)]
    #[validate(custom(function = "validate_path_prefix"))]
    pub path_prefix: String,

    /// Identify header-less clients by their TCP peer address instead of
    /// the shared "unknown" bucket
    #[arg(long, env = "RATE_LIMIT_PEER_FALLBACK", default_value_t = false)]
    pub peer_address_fallback: bool,

    /// Soft cap on in-memory quota records
    #[arg(long, env = "MAX_TRACKED_CLIENTS", default_value_t = 100_000)]
    #[validate(range(min = 1))]
    pub max_tracked_clients: usize,

    /// Seconds between sweeps of expired quota records
    #[arg(long = "cleanup-interval-secs", env = "CLEANUP_INTERVAL", default_value_t = 60)]
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

fn validate_path_prefix(prefix: &str) -> std::result::Result<(), ValidationError> {
    if prefix.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::new("path_prefix_must_start_with_slash"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            redis_url: None,
            max_requests: DEFAULT_MAX_REQUESTS,
            window_ms: DEFAULT_WINDOW_MS,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            peer_address_fallback: false,
            max_tracked_clients: 100_000,
            cleanup_interval_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from command line arguments and environment variables
    pub fn load() -> Result<Self> {
        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.max_requests, self.window_duration())
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
